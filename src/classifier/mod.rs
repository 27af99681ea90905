//! Event classifier: raw gateway event JSON → utterance drafts.
//!
//! Pure with respect to the gateway: the classifier never touches the
//! socket. For each decoded event it builds either an event description
//! (LLM mode), a canned reply (no-LLM mode), or — for chat commands — a
//! confirmation line after mutating the voice registry. Drafts land in the
//! utterance queue; playback order is the queue's concern.
//!
//! Chat commands are matched exact-first, then by prefix:
//!
//! | pattern | effect |
//! |---|---|
//! | `我的音色` (exact) | reply with the user's current voice name |
//! | `换音色` (exact) | bind a random catalog voice |
//! | `换…` (prefix) | bind the named voice, random fallback |

pub mod texts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;
use rand::Rng;

use crate::events::{
    self, guard_tier_name, DanmakuData, GiftData, GuardData, LikeData, LiveEndData, LiveMessage,
    LiveStartData, RoomEnterData, SuperChatData, SuperChatDelData,
};
use crate::queue::{DraftKind, UtteranceDraft, UtteranceQueue};
use crate::voices::{VoiceCatalog, VoiceRegistry};

/// Probability of appending a hint line to a room-enter welcome.
const ENTER_HINT_PROBABILITY: f64 = 0.8;

/// A user's like streak decays after this much inactivity.
const LIKE_COMBO_WINDOW: Duration = Duration::from_secs(30);

// ── Like streaks ───────────────────────────────────────────────────

/// Per-user count of consecutive like events. Consecutive means within
/// [`LIKE_COMBO_WINDOW`] of the previous one; stale entries are swept on
/// every bump so the map stays bounded.
struct LikeComboTracker {
    streaks: PlMutex<HashMap<String, (u32, Instant)>>,
}

impl LikeComboTracker {
    fn new() -> Self {
        Self {
            streaks: PlMutex::new(HashMap::new()),
        }
    }

    /// Record a like event for `user` and return the current streak.
    fn bump(&self, user: &str) -> u32 {
        let mut streaks = self.streaks.lock();
        let now = Instant::now();
        streaks.retain(|_, (_, last)| now.duration_since(*last) <= LIKE_COMBO_WINDOW);

        let entry = streaks.entry(user.to_string()).or_insert((0, now));
        entry.0 += 1;
        entry.1 = now;
        entry.0
    }
}

/// Maps decoded events to utterance drafts and resolves voices.
pub struct EventClassifier {
    catalog: Arc<VoiceCatalog>,
    registry: Arc<VoiceRegistry>,
    queue: Arc<UtteranceQueue>,
    assistant_name: String,
    use_llm: bool,
    like_combos: LikeComboTracker,
}

impl EventClassifier {
    pub fn new(
        catalog: Arc<VoiceCatalog>,
        registry: Arc<VoiceRegistry>,
        queue: Arc<UtteranceQueue>,
        assistant_name: String,
        use_llm: bool,
    ) -> Self {
        Self {
            catalog,
            registry,
            queue,
            assistant_name,
            use_llm,
            like_combos: LikeComboTracker::new(),
        }
    }

    /// Decode and dispatch one `operation = 5` event body.
    pub fn handle_raw(&self, body: &[u8]) -> anyhow::Result<()> {
        let msg: LiveMessage = serde_json::from_slice(body)
            .map_err(|e| anyhow::anyhow!("undecodable event body: {e}"))?;

        match msg.cmd.as_str() {
            events::CMD_DANMAKU => self.on_danmaku(serde_json::from_value(msg.data)?),
            events::CMD_GIFT => self.on_gift(serde_json::from_value(msg.data)?),
            events::CMD_SUPER_CHAT => self.on_super_chat(serde_json::from_value(msg.data)?),
            events::CMD_SUPER_CHAT_DEL => self.on_super_chat_del(serde_json::from_value(msg.data)?),
            events::CMD_GUARD => self.on_guard(serde_json::from_value(msg.data)?),
            events::CMD_LIKE => self.on_like(serde_json::from_value(msg.data)?),
            events::CMD_ROOM_ENTER => self.on_room_enter(serde_json::from_value(msg.data)?),
            events::CMD_LIVE_START => self.on_live_start(serde_json::from_value(msg.data)?),
            events::CMD_LIVE_END => self.on_live_end(serde_json::from_value(msg.data)?),
            other => {
                tracing::warn!(cmd = other, "unknown event cmd, dropping");
                Ok(())
            }
        }
    }

    fn default_kind(&self) -> DraftKind {
        if self.use_llm {
            DraftKind::Normal
        } else {
            DraftKind::NoLlmReply
        }
    }

    fn enqueue(&self, text: String, kind: DraftKind, voice: crate::voices::VoiceRef) {
        self.queue
            .enqueue(UtteranceDraft::new(text, kind, voice));
    }

    // ── danmaku ───────────────────────────────────────────────────

    fn on_danmaku(&self, data: DanmakuData) -> anyhow::Result<()> {
        if data.msg.trim().is_empty() {
            tracing::debug!(user = %data.uname, "empty chat message dropped");
            return Ok(());
        }

        tracing::info!(user = %data.uname, msg = %data.msg, room = data.room_id, "chat");

        if self.try_command(&data) {
            return Ok(());
        }

        let voice = self.registry.get_voice(&data.uname);
        let text = if self.use_llm {
            let mut description =
                format!("【弹幕消息】用户 {} 发送了弹幕：{}", data.uname, data.msg);
            if data.guard_level > 0 {
                description.push_str(&format!("（{}）", guard_tier_name(data.guard_level)));
            }
            description
        } else {
            format!("{} 说：{}", data.uname, data.msg)
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    /// Exact-match commands first, then prefix commands. Returns true when
    /// the message was consumed as a command.
    fn try_command(&self, data: &DanmakuData) -> bool {
        match data.msg.as_str() {
            "我的音色" => {
                self.cmd_query_voice(&data.uname);
                return true;
            }
            "换音色" => {
                self.cmd_random_switch(&data.uname);
                return true;
            }
            _ => {}
        }

        if let Some(rest) = data.msg.strip_prefix('换') {
            if !rest.is_empty() {
                self.cmd_switch_by_name(&data.uname, rest.trim());
                return true;
            }
        }

        false
    }

    fn cmd_query_voice(&self, user: &str) {
        let voice = self.registry.get_voice(user);
        let text = format!("{} 当前使用的音色是：{}", user, voice.name);
        tracing::info!(user, voice = %voice.name, "voice query command");
        self.registry.touch(user);
        self.enqueue(text, DraftKind::Command, voice);
    }

    fn cmd_random_switch(&self, user: &str) {
        let voice = self.catalog.random().clone();
        let text = format!("{} 的播报音色已随机切换为 {}", user, voice.name);
        tracing::info!(user, voice = %voice.name, "random voice switch command");
        if let Err(e) = self.registry.set_voice(user, &voice.voice_type) {
            tracing::error!(user, error = %e, "failed to persist voice switch");
        }
        self.enqueue(text, DraftKind::Command, voice);
    }

    fn cmd_switch_by_name(&self, user: &str, requested: &str) {
        let (voice, text) = match self.catalog.by_name(requested) {
            Some(found) => {
                let voice = found.clone();
                let text = format!("{} 的播报音色已切换为 {}", user, voice.name);
                (voice, text)
            }
            None => {
                let voice = self.catalog.random().clone();
                let text = format!(
                    "{} 指定的音色 \"{}\" 不存在，已随机切换为 {}",
                    user, requested, voice.name
                );
                (voice, text)
            }
        };

        tracing::info!(user, requested, voice = %voice.name, "named voice switch command");
        if let Err(e) = self.registry.set_voice(user, &voice.voice_type) {
            tracing::error!(user, error = %e, "failed to persist voice switch");
        }
        self.enqueue(text, DraftKind::Command, voice);
    }

    // ── gift / superchat / guard / like ───────────────────────────

    fn on_gift(&self, data: GiftData) -> anyhow::Result<()> {
        tracing::info!(
            user = %data.uname,
            gift = %data.gift_name,
            num = data.gift_num,
            price = data.price,
            "gift"
        );

        let voice = self.registry.get_voice(&data.uname);
        let text = if self.use_llm {
            if data.gift_num > 1 {
                format!(
                    "【礼物】用户 {} 送出了 {}个 {}（总价值：{}）",
                    data.uname, data.gift_num, data.gift_name, data.price
                )
            } else {
                format!(
                    "【礼物】用户 {} 送出了 {}（价值：{}）",
                    data.uname, data.gift_name, data.price
                )
            }
        } else {
            // The price is only spoken for paid gifts; free ones get the
            // plain thank-you.
            let price_clause = if data.paid {
                format!("，价值{}元", format_gift_price(data.price))
            } else {
                String::new()
            };
            if data.gift_num > 1 {
                format!(
                    "感谢{}赠送了 {}个 {}{}，{}",
                    data.uname,
                    data.gift_num,
                    data.gift_name,
                    price_clause,
                    texts::random_blessing()
                )
            } else {
                format!(
                    "感谢{}赠送了 {}{}，{}",
                    data.uname,
                    data.gift_name,
                    price_clause,
                    texts::random_blessing()
                )
            }
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    fn on_super_chat(&self, data: SuperChatData) -> anyhow::Result<()> {
        tracing::info!(user = %data.uname, rmb = data.rmb, message = %data.message, "superchat");

        let voice = self.registry.get_voice(&data.uname);
        let text = if self.use_llm {
            format!(
                "【付费留言】用户 {} 发送了 {}元 的付费留言：{}",
                data.uname, data.rmb, data.message
            )
        } else {
            format!(
                "{}的付费留言（{}元）：{}，{}",
                data.uname,
                data.rmb,
                data.message,
                texts::random_blessing()
            )
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    fn on_super_chat_del(&self, data: SuperChatDelData) -> anyhow::Result<()> {
        // Takedowns never produce an utterance.
        tracing::info!(room = data.room_id, message_ids = ?data.message_ids, "superchat deleted");
        Ok(())
    }

    fn on_guard(&self, data: GuardData) -> anyhow::Result<()> {
        let user = &data.user_info.uname;
        let tier = guard_tier_name(data.guard_level);
        tracing::info!(
            user = %user,
            level = data.guard_level,
            num = data.guard_num,
            price = data.price,
            "guard purchase"
        );

        let voice = self.registry.get_voice(user);
        let text = if self.use_llm {
            if data.guard_num > 1 {
                format!(
                    "【大航海】用户 {} 购买了 {}{} {}（总价值：{}）",
                    user, data.guard_num, data.guard_unit, tier, data.price
                )
            } else {
                format!("【大航海】用户 {} 购买了 {}（价值：{}）", user, tier, data.price)
            }
        } else {
            let duration = guard_duration_prefix(data.guard_num, &data.guard_unit);
            format!(
                "感谢{}给主播赠送了{}{}，{}",
                user,
                duration,
                tier,
                texts::random_blessing()
            )
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    fn on_like(&self, data: LikeData) -> anyhow::Result<()> {
        tracing::info!(user = %data.uname, count = data.like_count, "like");

        let voice = self.registry.get_voice(&data.uname);
        let text = if self.use_llm {
            format!(
                "【点赞】用户 {} 为直播间点了 {} 个赞",
                data.uname, data.like_count
            )
        } else {
            let streak = self.like_combos.bump(&data.uname);
            tracing::debug!(user = %data.uname, streak, "like streak");
            let mut text = texts::like_thanks(&data.uname, streak);
            // Big click batches get a blessing suffix on top of the
            // streak-tier template.
            if data.like_count >= 5 {
                if text.ends_with('！') {
                    text.pop();
                }
                text.push('，');
                text.push_str(texts::random_blessing());
            }
            text
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    // ── room enter / live start / live end ────────────────────────

    fn on_room_enter(&self, data: RoomEnterData) -> anyhow::Result<()> {
        let voice = self.registry.get_voice(&data.uname);
        tracing::info!(user = %data.uname, voice = %voice.name, "room enter");

        let text = if self.use_llm {
            format!("【进入房间】用户 {} 进入了直播间", data.uname)
        } else {
            let hint = if rand::thread_rng().gen_bool(ENTER_HINT_PROBABILITY) {
                format!("，{}", texts::enter_hint(&self.assistant_name, &self.catalog))
            } else {
                String::new()
            };
            format!("欢迎{}进入直播间{}", data.uname, hint)
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    fn on_live_start(&self, data: LiveStartData) -> anyhow::Result<()> {
        tracing::info!(room = data.room_id, title = %data.title, "live started");

        let voice = self.catalog.random().clone();
        let text = if self.use_llm {
            format!("【直播开始】主播开始了直播，房间号：{}", data.room_id)
        } else {
            format!("直播开始，房间号：{}", data.room_id)
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }

    fn on_live_end(&self, data: LiveEndData) -> anyhow::Result<()> {
        tracing::info!(room = data.room_id, "live ended");

        let voice = self.catalog.random().clone();
        let text = if self.use_llm {
            format!("【直播结束】主播结束了直播，房间号：{}", data.room_id)
        } else {
            format!("直播结束，房间号：{}", data.room_id)
        };

        self.enqueue(text, self.default_kind(), voice);
        Ok(())
    }
}

impl crate::gateway::ws::EventSink for EventClassifier {
    fn on_event(&self, body: &[u8]) -> anyhow::Result<()> {
        self.handle_raw(body)
    }
}

/// Gift unit price in yuan (1000 = 1 元), with trailing zeros trimmed:
/// 1500 → "1.5", 1230 → "1.23", 1000 → "1".
fn format_gift_price(price: i64) -> String {
    let mut text = format!("{:.2}", price as f64 / 1000.0);
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    text
}

/// "一个月的" / "3个月的" style duration prefix for guard thank-you lines.
fn guard_duration_prefix(num: i64, unit: &str) -> String {
    match (num, unit) {
        (1, "月") => "一个月的".to_string(),
        (n, "月") => format!("{n}个月的"),
        (1, "") => "一个".to_string(),
        (n, "") => format!("{n}个"),
        (1, u) => format!("一{u}的"),
        (n, u) => format!("{n}{u}的"),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
