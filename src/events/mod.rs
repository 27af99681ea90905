//! Decoded gateway event bodies.
//!
//! Every `operation = 5` frame carries a JSON object whose `cmd` string
//! discriminates the event. The structs below mirror the open-platform
//! payloads; fields the pipeline never reads are omitted and tolerated by
//! serde's default behavior of ignoring unknown keys.

use serde::Deserialize;

// ── cmd discriminators ─────────────────────────────────────────────

pub const CMD_DANMAKU: &str = "LIVE_OPEN_PLATFORM_DM";
pub const CMD_GIFT: &str = "LIVE_OPEN_PLATFORM_SEND_GIFT";
pub const CMD_SUPER_CHAT: &str = "LIVE_OPEN_PLATFORM_SUPER_CHAT";
pub const CMD_SUPER_CHAT_DEL: &str = "LIVE_OPEN_PLATFORM_SUPER_CHAT_DEL";
pub const CMD_GUARD: &str = "LIVE_OPEN_PLATFORM_GUARD";
pub const CMD_LIKE: &str = "LIVE_OPEN_PLATFORM_LIKE";
pub const CMD_ROOM_ENTER: &str = "LIVE_OPEN_PLATFORM_LIVE_ROOM_ENTER";
pub const CMD_LIVE_START: &str = "LIVE_OPEN_PLATFORM_LIVE_START";
pub const CMD_LIVE_END: &str = "LIVE_OPEN_PLATFORM_LIVE_END";

/// Envelope read first to pick the concrete event type.
#[derive(Debug, Deserialize)]
pub struct LiveMessage {
    pub cmd: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ── Event payloads ─────────────────────────────────────────────────

/// Chat message (danmaku).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DanmakuData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub msg_id: String,
    /// 1 = governor, 2 = admiral, 3 = captain, 0 = none.
    #[serde(default)]
    pub guard_level: i32,
    #[serde(default)]
    pub timestamp: i64,
}

/// Gift.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GiftData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub gift_id: i64,
    #[serde(default)]
    pub gift_name: String,
    #[serde(default)]
    pub gift_num: i64,
    /// Unit price; 1000 = 1 CNY.
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub timestamp: i64,
}

/// Paid pinned message (superchat).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuperChatData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub message: String,
    /// Paid amount in CNY.
    #[serde(default)]
    pub rmb: i64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Superchat takedown. Parsed, logged, never voiced.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuperChatDelData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardUserInfo {
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub uname: String,
}

/// Tiered paid subscription.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardData {
    #[serde(default)]
    pub user_info: GuardUserInfo,
    /// 1 = governor, 2 = admiral, 3 = captain.
    #[serde(default)]
    pub guard_level: i32,
    #[serde(default)]
    pub guard_num: i64,
    /// Normally "月".
    #[serde(default)]
    pub guard_unit: String,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Like burst.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LikeData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Viewer entered the room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomEnterData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Stream went live.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveStartData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub area_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Stream ended.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveEndData {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub area_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Guard tier display name ("大航海" when the level is unknown).
pub fn guard_tier_name(level: i32) -> &'static str {
    match level {
        1 => "总督",
        2 => "提督",
        3 => "舰长",
        _ => "大航海",
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danmaku_body_decodes() {
        let body = r#"{"cmd":"LIVE_OPEN_PLATFORM_DM","data":{"room_id":7734200,"uname":"Ann","msg":"hi","guard_level":3,"open_id":"oid-1"}}"#;
        let msg: LiveMessage = serde_json::from_str(body).unwrap();
        assert_eq!(msg.cmd, CMD_DANMAKU);

        let data: DanmakuData = serde_json::from_value(msg.data).unwrap();
        assert_eq!(data.uname, "Ann");
        assert_eq!(data.msg, "hi");
        assert_eq!(data.guard_level, 3);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = r#"{"uname":"Ben","gift_name":"小花花","gift_num":3,"price":100,"combo_info":{"combo_count":2},"blind_gift":{"status":false}}"#;
        let data: GiftData = serde_json::from_str(body).unwrap();
        assert_eq!(data.gift_name, "小花花");
        assert_eq!(data.gift_num, 3);
    }

    #[test]
    fn missing_fields_default() {
        let data: LikeData = serde_json::from_str(r#"{"uname":"C"}"#).unwrap();
        assert_eq!(data.like_count, 0);
        assert_eq!(data.room_id, 0);
    }

    #[test]
    fn guard_tier_names() {
        assert_eq!(guard_tier_name(1), "总督");
        assert_eq!(guard_tier_name(2), "提督");
        assert_eq!(guard_tier_name(3), "舰长");
        assert_eq!(guard_tier_name(0), "大航海");
        assert_eq!(guard_tier_name(9), "大航海");
    }

    #[test]
    fn superchat_del_list_decodes() {
        let data: SuperChatDelData =
            serde_json::from_str(r#"{"room_id":1,"message_ids":[4,5,6]}"#).unwrap();
        assert_eq!(data.message_ids, vec![4, 5, 6]);
    }
}
