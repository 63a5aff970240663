use core::fmt;

use serde::{Deserialize, Serialize};

macro_rules! impl_entity_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub String);

            impl $name {
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    $name(value)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    $name(value.to_string())
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_entity_id!(TeamId, ChannelId, UserId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub team_id: TeamId,
}

/// Presence state as reported by `users/status`.
///
/// Values the server adds later decode as `Unknown` rather than failing the whole response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Away,
    Offline,
    Dnd,
    #[serde(rename = "ooo")]
    OutOfOffice,
    #[serde(other)]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Away => "away",
            Status::Offline => "offline",
            Status::Dnd => "dnd",
            Status::OutOfOffice => "ooo",
            Status::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---
//  Wire models
//
//  Only the fields we consume are declared; everything else in the payloads is ignored.
// ---

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireLoginUser {
    pub id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireTeam {
    pub id: TeamId,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireChannel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub team_id: Option<TeamId>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireChannelMember {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireStatus {
    pub user_id: UserId,
    pub status: Status,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireUser {
    pub id: UserId,
    pub username: String,
}

/// Body of a non-2xx response from the API.
#[derive(Debug, Clone, Deserialize)]
pub(super) struct WireAppError {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
}

impl From<WireTeam> for Team {
    fn from(value: WireTeam) -> Self {
        Self {
            id: value.id,
            name: value.name,
        }
    }
}

impl WireChannel {
    /// Display name, then handle, then `"unknown"`. Direct and group messages have no
    /// `team_id`, so the team being walked is used instead.
    pub fn into_channel(self, team_id: &TeamId) -> Channel {
        let name = [self.display_name, self.name]
            .into_iter()
            .find(|n| !n.trim().is_empty())
            .unwrap_or_else(|| String::from("unknown"));

        Channel {
            id: self.id,
            name,
            team_id: self
                .team_id
                .filter(|id| !id.as_str().is_empty())
                .unwrap_or_else(|| team_id.clone()),
        }
    }
}
