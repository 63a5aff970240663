use std::collections::HashMap;

use super::types::{Channel, ChannelId, Status, TeamId, UserId};

/// Memoized lookups for the lifetime of one client, and therefore one run.
///
/// Nothing is ever evicted or invalidated; every run starts from an empty cache.
#[derive(Debug, Default)]
pub struct RunCache {
    channels: HashMap<TeamId, Vec<Channel>>,
    members: HashMap<ChannelId, Vec<UserId>>,
    statuses: HashMap<UserId, Status>,
    usernames: HashMap<UserId, String>,
    hits: usize,
}

impl RunCache {
    pub fn channels(&mut self, team_id: &TeamId) -> Option<Vec<Channel>> {
        let found = self.channels.get(team_id).cloned();
        self.count(found)
    }

    pub fn members(&mut self, channel_id: &ChannelId) -> Option<Vec<UserId>> {
        let found = self.members.get(channel_id).cloned();
        self.count(found)
    }

    pub fn status(&mut self, user_id: &UserId) -> Option<Status> {
        let found = self.statuses.get(user_id).copied();
        self.count(found)
    }

    pub fn username(&mut self, user_id: &UserId) -> Option<String> {
        let found = self.usernames.get(user_id).cloned();
        self.count(found)
    }

    pub fn store_channels(&mut self, team_id: TeamId, channels: Vec<Channel>) {
        self.channels.insert(team_id, channels);
    }

    pub fn store_members(&mut self, channel_id: ChannelId, members: Vec<UserId>) {
        self.members.insert(channel_id, members);
    }

    pub fn store_status(&mut self, user_id: UserId, status: Status) {
        self.statuses.insert(user_id, status);
    }

    pub fn store_username(&mut self, user_id: UserId, username: String) {
        self.usernames.insert(user_id, username);
    }

    /// Number of lookups answered without a request
    pub fn hits(&self) -> usize {
        self.hits
    }

    fn count<T>(&mut self, found: Option<T>) -> Option<T> {
        if found.is_some() {
            self.hits += 1;
        }
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hits_counted_only_on_presence() {
        let mut cache = RunCache::default();
        let user: UserId = "u1".into();

        assert!(cache.status(&user).is_none());
        assert_eq!(cache.hits(), 0);

        cache.store_status(user.clone(), Status::Online);
        cache.store_username(user.clone(), "alice".into());

        assert_eq!(cache.status(&user), Some(Status::Online));
        assert_eq!(cache.username(&user).as_deref(), Some("alice"));
        assert_eq!(cache.hits(), 2);
    }
}
