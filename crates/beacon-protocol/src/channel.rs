//! Channel naming for Beacon.
//!
//! A channel key is a type tag and an entity id joined by `:`. Channels have no
//! existence of their own; they are created implicitly by the first subscriber.

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Global channel carrying every presence change.
pub const PRESENCE_GLOBAL: &str = "presence:global";

/// Global channel carrying every new match.
pub const MATCHES_GLOBAL: &str = "matches:global";

/// Type tag for a user's private notification channel.
pub const USER_NOTIFICATIONS: &str = "user-notifications";

/// Type tag for a chat room channel.
pub const CHAT_ROOM: &str = "chat-room";

/// A user's private notification channel.
#[must_use]
pub fn user_notifications(user_id: &str) -> String {
    format!("{USER_NOTIFICATIONS}:{user_id}")
}

/// A chat room channel.
#[must_use]
pub fn chat_room(room_id: &str) -> String {
    format!("{CHAT_ROOM}:{room_id}")
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}
