//! Run configuration sourced from the process environment (and `.env`, via [`dotenvy`]).
//!
//! Deserialization follows the approach of the [`envy`] crate: the environment is exposed to
//! serde as a string map, and each value is parsed on demand into the target field's type. This
//! keeps `rename_all`/`default` attributes working on the config structs.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::de::value::MapDeserializer;
use serde::de::{self, IntoDeserializer};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

/// Connection and tuning parameters for a single collection run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    pub mm_url: String,
    pub mm_user: String,
    pub mm_password: Secret,

    pub pg_host: String,
    #[serde(default = "default_pg_port")]
    pub pg_port: u16,
    pub pg_user: String,
    pub pg_password: Secret,
    pub pg_db: String,

    /// Seconds between consecutive outbound API requests
    #[serde(default = "default_api_delay")]
    pub api_delay: f64,
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff: f64,
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    /// Rows per multi-row `INSERT`
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub timescale_enabled: bool,
}

/// Telemetry settings, read separately so that logging is available even when the run
/// configuration turns out to be incomplete.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TelemetryEnv {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub rust_log: Option<String>,
}

impl Env {
    pub fn from_env() -> EnvResult<Self> {
        Self::from_vars(dotenvy::vars())
    }

    pub fn from_vars<Iter>(vars: Iter) -> EnvResult<Self>
    where
        Iter: IntoIterator<Item = (String, String)>,
    {
        from_iter::<_, Env>(vars)?.validated()
    }

    fn validated(self) -> EnvResult<Self> {
        let required = [
            ("MM_URL", self.mm_url.as_str()),
            ("MM_USER", self.mm_user.as_str()),
            ("MM_PASSWORD", self.mm_password.expose()),
            ("PG_HOST", self.pg_host.as_str()),
            ("PG_USER", self.pg_user.as_str()),
            ("PG_PASSWORD", self.pg_password.expose()),
            ("PG_DB", self.pg_db.as_str()),
        ];

        if let Some(&(name, _)) = required.iter().find(|(_, val)| val.trim().is_empty()) {
            return Err(EnvErr::EmptyValue(name));
        }

        for (name, secs) in [
            ("API_DELAY", self.api_delay),
            ("RATE_LIMIT_BACKOFF", self.rate_limit_backoff),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(EnvErr::Invalid {
                    var: name,
                    reason: format!("expected a non-negative number of seconds, got {secs}"),
                });
            }
        }

        if self.batch_size == 0 {
            return Err(EnvErr::Invalid {
                var: "BATCH_SIZE",
                reason: "must be at least 1".into(),
            });
        }

        Ok(self)
    }

    /// Base URL for API v4 requests. A bare hostname is assumed to be served over https.
    pub fn api_base_url(&self) -> String {
        let url = self.mm_url.trim().trim_end_matches('/');
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };

        format!("{url}{}", crate::constants::API_PATH_PREFIX)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.api_delay)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_backoff)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout)
    }

    pub fn pg_connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.pg_host)
            .port(self.pg_port)
            .username(&self.pg_user)
            .password(self.pg_password.expose())
            .database(&self.pg_db)
            .application_name(crate::constants::SERVICE_NAME)
    }
}

impl TelemetryEnv {
    pub fn from_env() -> EnvResult<Self> {
        Ok(from_iter(dotenvy::vars())?)
    }
}

#[inline]
const fn default_pg_port() -> u16 {
    5432
}

#[inline]
const fn default_api_delay() -> f64 {
    0.001
}

#[inline]
const fn default_api_timeout() -> u64 {
    30
}

#[inline]
const fn default_rate_limit_backoff() -> f64 {
    5.0
}

#[inline]
const fn default_rate_limit_retries() -> u32 {
    1
}

#[inline]
const fn default_batch_size() -> usize {
    100
}

/// Credential wrapper which keeps its contents out of `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_string())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(**redacted**)")
    }
}

// ---
//  Deserializer implementation
// ---

/// A single variable's value, carrying its name for error reporting.
struct VarValue {
    name: String,
    value: String,
}

struct VarName(String);

struct VarMap<Iter> {
    inner: Iter,
}

impl<Iter: Iterator<Item = (String, String)>> Iterator for VarMap<Iter> {
    type Item = (VarName, VarValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(name, value)| (VarName(name.clone()), VarValue { name, value }))
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for VarValue {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for VarName {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! parse_then_visit {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.value.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(de::Error::custom(format_args!(
                        "{}: while parsing '{}' ({})",
                        e, self.value, self.name
                    ))),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for VarValue {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.value.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.value.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.value.into_deserializer())
    }

    parse_then_visit! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map seq
        unit_struct tuple_struct identifier tuple
        ignored_any struct
    }
}

impl<'de> de::Deserializer<'de> for VarName {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map newtype_struct
        unit_struct tuple_struct identifier tuple ignored_any
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 enum struct
    }
}

struct Deserializer<'de, Iter: Iterator<Item = (String, String)>> {
    inner: MapDeserializer<'de, VarMap<Iter>, EnvDeserializeError>,
}

impl<'de, Iter: Iterator<Item = (String, String)>> de::Deserializer<'de>
    for Deserializer<'de, Iter>
{
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self.inner)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map
        newtype_struct unit_struct tuple_struct identifier
        tuple ignored_any bool u8 u16 u32 u64 i8 i16 i32 i64
        f32 f64 enum struct
    }
}

pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    T::deserialize(Deserializer {
        inner: MapDeserializer::new(VarMap {
            inner: iter.into_iter(),
        }),
    })
}

impl de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.to_uppercase())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),

    #[error("required variable {0} is empty")]
    EmptyValue(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing required variable {0}")]
    MissingValue(String),
}
