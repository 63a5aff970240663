use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mattermost::types::{Channel, ChannelId, Status, Team, TeamId, UserId};

/// One observed (team, channel, member) triple with the member's presence at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshotRecord {
    pub timestamp: DateTime<Utc>,
    pub team_id: TeamId,
    pub team_name: String,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub user_id: UserId,
    pub username: String,
    pub status: Status,
}

impl StatusSnapshotRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        team: &Team,
        channel: &Channel,
        user_id: &UserId,
        username: &str,
        status: Status,
    ) -> Self {
        Self {
            timestamp,
            team_id: team.id.clone(),
            team_name: team.name.clone(),
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            user_id: user_id.clone(),
            username: username.to_string(),
            status,
        }
    }
}
