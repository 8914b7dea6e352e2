//! Channel/user registry and session-scoped server info (§3 Data Model).
//!
//! Exclusively owned and mutated by the TLS control client (C4); every
//! other component only ever reads a snapshot or a borrow. Mirrors the
//! merge semantics r2dj's `mumble` crate uses for `ChannelState`/`UserState`
//! deltas, adapted to the richer field set this gateway forwards to the
//! browser.

use std::collections::{HashMap, HashSet};

use crate::messages::{ChannelState, UserState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub parent_id: Option<u32>,
    pub position: Option<i32>,
    pub description: Option<String>,
    pub links: HashSet<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub name: String,
    pub channel_id: u32,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub welcome_message: Option<String>,
    pub max_bandwidth: Option<u32>,
    pub version: Option<u32>,
    pub opus: Option<bool>,
    pub self_user_id: u32,
    pub root_channel_id: u32,
    pub synced: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    pub channels: HashMap<u32, Channel>,
    pub users: HashMap<u32, User>,
    pub server_info: ServerInfo,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        registry.channels.insert(
            0,
            Channel {
                id: 0,
                name: "Root".to_string(),
                parent_id: None,
                ..Default::default()
            },
        );
        registry
    }

    /// Applies a `ChannelState` delta, creating the channel on first sight.
    /// Copy-on-update for scalar fields; link set is replaced wholesale if
    /// the message carries a full list, otherwise the add/remove deltas
    /// are applied — never both in the same message per the wire format.
    pub fn apply_channel_state(&mut self, state: ChannelState) {
        let channel = self.channels.entry(state.channel_id).or_insert_with(|| Channel {
            id: state.channel_id,
            parent_id: Some(0),
            ..Default::default()
        });

        if let Some(name) = state.name {
            channel.name = name;
        }
        if let Some(parent) = state.parent {
            channel.parent_id = Some(parent);
        }
        if let Some(position) = state.position {
            channel.position = Some(position);
        }
        if let Some(description) = state.description {
            channel.description = Some(description);
        }

        if let Some(links) = state.links {
            channel.links = links.into_iter().collect();
        } else {
            for added in state.links_add {
                channel.links.insert(added);
            }
            for removed in state.links_remove {
                channel.links.remove(&removed);
            }
        }
    }

    pub fn remove_channel(&mut self, channel_id: u32) {
        self.channels.remove(&channel_id);
    }

    /// Applies a `UserState` delta. Per §3, a user's `channelId` defaults
    /// to root (0) the first time they're seen without one, and is
    /// preserved (not reset) on subsequent updates that omit it.
    pub fn apply_user_state(&mut self, state: UserState) {
        let user = self.users.entry(state.session).or_insert_with(|| User {
            id: state.session,
            channel_id: 0,
            ..Default::default()
        });

        if let Some(name) = state.name {
            user.name = name;
        }
        if let Some(channel_id) = state.channel_id {
            user.channel_id = channel_id;
        }
        if let Some(mute) = state.mute {
            user.mute = Some(mute);
        }
        if let Some(deaf) = state.deaf {
            user.deaf = Some(deaf);
        }
        if let Some(suppress) = state.suppress {
            user.suppress = Some(suppress);
        }
        if let Some(self_mute) = state.self_mute {
            user.self_mute = Some(self_mute);
        }
        if let Some(self_deaf) = state.self_deaf {
            user.self_deaf = Some(self_deaf);
        }
    }

    pub fn remove_user(&mut self, session: u32) {
        self.users.remove(&session);
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn user(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_without_channel_id_defaults_to_root_then_preserves() {
        let mut registry = Registry::new();
        registry.apply_user_state(UserState {
            session: 7,
            name: Some("alice".into()),
            ..Default::default()
        });
        assert_eq!(registry.user(7).unwrap().channel_id, 0);

        // A later update that omits channel_id must not reset it back to 0
        // once it has been moved.
        registry.apply_user_state(UserState {
            session: 7,
            channel_id: Some(3),
            ..Default::default()
        });
        registry.apply_user_state(UserState {
            session: 7,
            mute: Some(true),
            ..Default::default()
        });
        assert_eq!(registry.user(7).unwrap().channel_id, 3);
        assert_eq!(registry.user(7).unwrap().mute, Some(true));
    }

    #[test]
    fn channel_links_full_replace_vs_delta() {
        let mut registry = Registry::new();
        registry.apply_channel_state(ChannelState {
            channel_id: 1,
            links: Some(vec![2, 3]),
            ..Default::default()
        });
        assert_eq!(registry.channel(1).unwrap().links, [2, 3].into_iter().collect());

        registry.apply_channel_state(ChannelState {
            channel_id: 1,
            links_add: vec![4],
            links_remove: vec![2],
            ..Default::default()
        });
        assert_eq!(registry.channel(1).unwrap().links, [3, 4].into_iter().collect());
    }

    #[test]
    fn root_channel_exists_by_default() {
        let registry = Registry::new();
        assert!(registry.channel(0).is_some());
        assert_eq!(registry.channel(0).unwrap().parent_id, None);
    }
}
