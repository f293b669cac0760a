// Room-name resolution from a WebSocket request path.

use thiserror::Error;

/// Room joined when the request path is empty.
pub const DEFAULT_ROOM_NAME: &str = "default-room";

/// Maximum allowed room name length in characters.
const MAX_ROOM_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomNameError {
    #[error("room name exceeds maximum length of {MAX_ROOM_CHARS} characters")]
    TooLong,

    #[error("room name contains a control character")]
    ControlCharacter,
}

/// Resolve the room a connection asked for.
///
/// Rules:
/// - Strip one leading `/`
/// - Drop the query string
/// - Map an empty remainder to `default`
/// - No percent-decoding; the raw segment is the identifier
pub fn resolve_room_name(path_and_query: &str, default: &str) -> Result<String, RoomNameError> {
    let path = path_and_query.split('?').next().unwrap_or_default();
    let name = path.strip_prefix('/').unwrap_or(path);

    if name.is_empty() {
        return Ok(default.to_string());
    }
    if name.chars().count() > MAX_ROOM_CHARS {
        return Err(RoomNameError::TooLong);
    }
    if name.chars().any(char::is_control) {
        return Err(RoomNameError::ControlCharacter);
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_is_stripped() {
        assert_eq!(resolve_room_name("/r1", DEFAULT_ROOM_NAME).unwrap(), "r1");
    }

    #[test]
    fn query_string_is_ignored() {
        assert_eq!(
            resolve_room_name("/spreadsheet-demo-room?token=abc", DEFAULT_ROOM_NAME).unwrap(),
            "spreadsheet-demo-room"
        );
    }

    #[test]
    fn empty_path_maps_to_default() {
        assert_eq!(resolve_room_name("/", DEFAULT_ROOM_NAME).unwrap(), "default-room");
        assert_eq!(resolve_room_name("", DEFAULT_ROOM_NAME).unwrap(), "default-room");
        assert_eq!(resolve_room_name("/?x=1", "lobby").unwrap(), "lobby");
    }

    #[test]
    fn nested_segments_are_kept_verbatim() {
        assert_eq!(resolve_room_name("/team/a%20b", DEFAULT_ROOM_NAME).unwrap(), "team/a%20b");
    }

    #[test]
    fn overlong_name_is_rejected() {
        let path = format!("/{}", "a".repeat(MAX_ROOM_CHARS + 1));
        assert_eq!(resolve_room_name(&path, DEFAULT_ROOM_NAME), Err(RoomNameError::TooLong));
    }

    #[test]
    fn control_characters_are_rejected() {
        assert_eq!(
            resolve_room_name("/bad\u{7}room", DEFAULT_ROOM_NAME),
            Err(RoomNameError::ControlCharacter)
        );
    }
}
