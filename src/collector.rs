//! Walks teams, channels and members, then resolves every distinct member once.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::instrument;

use crate::db::prelude::StatusSnapshotRecord;
use crate::mattermost::types::{Channel, ChannelId, Team, TeamId, UserId};
use crate::mattermost::{ApiError, LookupFailure, MattermostClient};

/// Everything observed during one run, stamped with a single timestamp.
#[derive(Debug)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub records: Vec<StatusSnapshotRecord>,
    /// Members which were seen but could not be resolved
    pub skipped: Vec<LookupFailure>,
    pub team_count: usize,
    pub channel_count: usize,
    pub user_count: usize,
}

struct ChannelMembers {
    channel: Channel,
    members: Vec<UserId>,
}

struct TeamWalk {
    team: Team,
    channels: Vec<ChannelMembers>,
}

pub struct StatusCollector<'c> {
    client: &'c mut MattermostClient,
}

impl<'c> StatusCollector<'c> {
    pub fn new(client: &'c mut MattermostClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self))]
    pub async fn collect(&mut self) -> CollectResult<Snapshot> {
        let timestamp = Utc::now();

        let session = self
            .client
            .authenticate()
            .await
            .map_err(CollectError::Authenticate)?;
        tracing::debug!(user_id = %session.user_id, "walking visible teams");

        let walk = self.walk().await?;

        let users: BTreeSet<UserId> = walk
            .iter()
            .flat_map(|t| t.channels.iter())
            .flat_map(|c| c.members.iter().cloned())
            .collect();
        let users: Vec<UserId> = users.into_iter().collect();

        tracing::info!(user_count = users.len(), "resolving distinct members");

        let statuses = self
            .client
            .get_user_statuses(&users)
            .await
            .map_err(CollectError::Lookup)?;
        let usernames = self
            .client
            .get_usernames(&users)
            .await
            .map_err(CollectError::Lookup)?;

        // first reason wins when a user failed both lookups
        let mut reasons: BTreeMap<UserId, String> = BTreeMap::new();
        for failure in statuses.failed.into_iter().chain(usernames.failed) {
            reasons.entry(failure.user_id).or_insert(failure.reason);
        }

        let skipped: Vec<LookupFailure> = users
            .iter()
            .filter(|id| !statuses.resolved.contains_key(*id) || !usernames.resolved.contains_key(*id))
            .map(|id| LookupFailure {
                user_id: id.clone(),
                reason: reasons
                    .remove(id)
                    .unwrap_or_else(|| String::from("unresolved")),
            })
            .collect();

        for failure in &skipped {
            tracing::warn!(user_id = %failure.user_id, reason = %failure.reason, "skipping unresolved user");
        }

        let mut seen: HashSet<(&TeamId, &ChannelId, &UserId)> = HashSet::new();
        let mut records = Vec::new();

        for TeamWalk { team, channels } in &walk {
            for ChannelMembers { channel, members } in channels {
                for user_id in members {
                    let (Some(status), Some(username)) = (
                        statuses.resolved.get(user_id),
                        usernames.resolved.get(user_id),
                    ) else {
                        continue;
                    };

                    if !seen.insert((&team.id, &channel.id, user_id)) {
                        continue;
                    }

                    records.push(StatusSnapshotRecord::new(
                        timestamp, team, channel, user_id, username, *status,
                    ));
                }
            }
        }

        let snapshot = Snapshot {
            timestamp,
            team_count: walk.len(),
            channel_count: walk.iter().map(|t| t.channels.len()).sum(),
            user_count: users.len(),
            records,
            skipped,
        };

        tracing::info!(
            %timestamp,
            teams = snapshot.team_count,
            channels = snapshot.channel_count,
            users = snapshot.user_count,
            records = snapshot.records.len(),
            skipped = snapshot.skipped.len(),
            requests = self.client.requests_sent(),
            cache_hits = self.client.cache_hits(),
            "snapshot collected"
        );

        Ok(snapshot)
    }

    /// Lists every team, its channels and their members. Any listing failure aborts the walk.
    async fn walk(&mut self) -> CollectResult<Vec<TeamWalk>> {
        let teams = self
            .client
            .list_teams()
            .await
            .map_err(CollectError::ListTeams)?;

        let mut seen_teams = HashSet::new();
        let mut seen_channels = HashSet::new();
        let mut walk = Vec::new();

        for team in teams {
            if !seen_teams.insert(team.id.clone()) {
                tracing::debug!(team_id = %team.id, "duplicate team in listing");
                continue;
            }

            let channels = self.client.list_channels(&team.id).await.map_err(|source| {
                CollectError::ListChannels {
                    team_id: team.id.clone(),
                    source,
                }
            })?;

            let mut walked = Vec::new();
            for channel in channels {
                // direct and group messages show up under every team
                if !seen_channels.insert(channel.id.clone()) {
                    tracing::debug!(channel_id = %channel.id, "channel already walked");
                    continue;
                }

                let members = self.client.list_members(&channel.id).await.map_err(|source| {
                    CollectError::ListMembers {
                        channel_id: channel.id.clone(),
                        source,
                    }
                })?;

                walked.push(ChannelMembers { channel, members });
            }

            walk.push(TeamWalk {
                team,
                channels: walked,
            });
        }

        Ok(walk)
    }
}

pub type CollectResult<T> = core::result::Result<T, CollectError>;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("authentication failed: {0}")]
    Authenticate(#[source] ApiError),

    #[error("listing teams failed: {0}")]
    ListTeams(#[source] ApiError),

    #[error("listing channels of team {team_id} failed: {source}")]
    ListChannels {
        team_id: TeamId,
        #[source]
        source: ApiError,
    },

    #[error("listing members of channel {channel_id} failed: {source}")]
    ListMembers {
        channel_id: ChannelId,
        #[source]
        source: ApiError,
    },

    #[error("user lookup failed: {0}")]
    Lookup(#[source] ApiError),
}
