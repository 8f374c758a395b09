//! Room identifier derivation
//!
//! Both the initiate and the answer path resolve the room through
//! [`resolve_room`], so the two sides of a 1:1 call always land in the same room.

use crate::identity::UserId;
use crate::types::RoomId;

/// Room identifier for a 1:1 call between `a` and `b`
///
/// The two identifiers are ordered lexicographically, so the result does not
/// depend on which side calls.
#[must_use]
pub fn direct_room(a: &UserId, b: &UserId) -> RoomId {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    RoomId::new(format!("{}_{}", lo.as_str(), hi.as_str()))
}

/// Resolve the room for a call
///
/// An explicit room (group, community channel) always wins; otherwise the
/// deterministic 1:1 room is derived.
#[must_use]
pub fn resolve_room(local: &UserId, remote: &UserId, explicit: Option<&RoomId>) -> RoomId {
    match explicit {
        Some(room) if !room.is_blank() => room.clone(),
        _ => direct_room(local, remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_room_is_order_independent() {
        let a = UserId::new("u1");
        let b = UserId::new("u2");
        assert_eq!(direct_room(&a, &b), direct_room(&b, &a));
        assert_eq!(direct_room(&a, &b).as_str(), "u1_u2");
    }

    #[test]
    fn test_explicit_room_wins() {
        let room = RoomId::new("group-42");
        let resolved = resolve_room(&UserId::new("b"), &UserId::new("a"), Some(&room));
        assert_eq!(resolved, room);
    }

    #[test]
    fn test_blank_explicit_room_falls_back() {
        let blank = RoomId::new("  ");
        let resolved = resolve_room(&UserId::new("zed"), &UserId::new("amy"), Some(&blank));
        assert_eq!(resolved.as_str(), "amy_zed");
    }
}
