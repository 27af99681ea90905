//! Co-host prompt builder.
//!
//! Turns the current event description plus the short-term memory ring into
//! a single user prompt. The dominant event class is detected from the
//! 【...】 tag so the instruction block and the reply-length budget can be
//! tuned per class.

// ── Event classes ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Danmaku,
    Guard,
    Gift,
    SuperChat,
    Like,
    RoomEnter,
    LiveStart,
    LiveEnd,
    Mixed,
}

/// Detect the dominant event class from the classifier's 【...】 tags.
pub fn classify_event(text: &str) -> EventClass {
    if text.contains("【弹幕消息】") {
        EventClass::Danmaku
    } else if text.contains("【大航海】") {
        EventClass::Guard
    } else if text.contains("【礼物】") {
        EventClass::Gift
    } else if text.contains("【付费留言】") {
        EventClass::SuperChat
    } else if text.contains("【点赞】") {
        EventClass::Like
    } else if text.contains("【进入房间】") {
        EventClass::RoomEnter
    } else if text.contains("【直播开始】") {
        EventClass::LiveStart
    } else if text.contains("【直播结束】") {
        EventClass::LiveEnd
    } else {
        EventClass::Mixed
    }
}

/// Gift names the room treats as high value; their descriptions get the
/// tighter reply budget and the awed instruction block.
const EXPENSIVE_GIFT_KEYWORDS: [&str; 12] = [
    "火箭",
    "超级火箭",
    "飞机",
    "游艇",
    "跑车",
    "城堡",
    "嘉年华",
    "摩天大楼",
    "小电视飞船",
    "C位光环",
    "节奏风暴",
    "告白气球",
];

/// Whether a gift event description mentions a high-value gift.
pub fn is_high_value_gift(text: &str) -> bool {
    EXPENSIVE_GIFT_KEYWORDS.iter().any(|k| text.contains(k))
}

fn length_requirement(class: EventClass, high_value_gift: bool) -> &'static str {
    match class {
        EventClass::Danmaku => "30-50字",
        EventClass::Guard => "25-40字",
        EventClass::Gift if high_value_gift => "25-40字",
        _ => "20-35字",
    }
}

fn class_instruction(class: EventClass, assistant: &str, high_value_gift: bool) -> String {
    match class {
        EventClass::Danmaku => format!(
            "针对弹幕消息，作为{assistant}你要先播报弹幕内容再直接回应，\
             提到用户名，语气活跃热情，注意用户的大航海等级。"
        ),
        EventClass::Guard => format!(
            "针对大航海购买，作为{assistant}你要按等级表达感谢：\
             总督要极度兴奋，提督要超级激动，舰长要热情欢迎上船。"
        ),
        EventClass::Gift if high_value_gift => format!(
            "针对高价值礼物，作为{assistant}你要超级兴奋，\
             表达对观众慷慨的惊叹和震撼感激。"
        ),
        EventClass::Gift => format!(
            "针对礼物打赏，作为{assistant}你要开心感谢，\
             夸奖观众的慷慨，语气温暖活泼。"
        ),
        EventClass::SuperChat => format!(
            "针对付费留言，作为{assistant}你要特别兴奋，可以简单回应留言内容，\
             根据金额适当调整兴奋程度。"
        ),
        EventClass::Like => {
            format!("针对点赞互动，作为{assistant}你要开心回应，鼓励继续互动。")
        }
        EventClass::RoomEnter => {
            format!("针对进入房间，作为{assistant}你要热情欢迎新朋友，简短而热情。")
        }
        EventClass::LiveStart => {
            format!("针对直播开始，作为{assistant}你要充满活力地宣布开播。")
        }
        EventClass::LiveEnd => {
            format!("针对直播结束，作为{assistant}你要温馨告别，感谢观众陪伴。")
        }
        EventClass::Mixed => format!(
            "针对混合事件，作为{assistant}你要综合考虑所有事件，优先回应最重要的一条。"
        ),
    }
}

// ── Prompt assembly ────────────────────────────────────────────────

/// Build the full co-host prompt from the current event description and
/// the memory ring (oldest first).
pub fn build_prompt(
    assistant_name: &str,
    room_description: &str,
    event_text: &str,
    recent_events: &[String],
) -> String {
    let class = classify_event(event_text);
    let high_value_gift = class == EventClass::Gift && is_high_value_gift(event_text);
    let length = length_requirement(class, high_value_gift);
    let instruction = class_instruction(class, assistant_name, high_value_gift);
    let recent = if recent_events.is_empty() {
        "（暂无）".to_string()
    } else {
        recent_events.join("\n")
    };

    format!(
        "你是直播间的助播{assistant_name}，作为独立的个体参与直播间互动，帮助提升直播间氛围。\n\
         \n\
         【直播环境】{room_description}\n\
         \n\
         【{assistant_name}的身份】\n\
         - 你是独立的助播{assistant_name}，不是代表主播，也不是为主播准备内容\n\
         - 你直接参与直播间互动，用活跃热情的语气营造氛围\n\
         - 你要用自己的名字{assistant_name}进行自我介绍和互动\n\
         \n\
         【回应要求】\n\
         - 控制在{length}以内，语气活跃热情有趣\n\
         - 避免重复事件内容，给出自然有趣的回应\n\
         - 适当使用网络流行语，保持年轻化语气\n\
         - 结合之前的事件信息，合理组织这条消息的回复\n\
         \n\
         【价值层级感谢规则】\n\
         总督>提督>舰长（按价值匹配感谢程度），高价值礼物表达震撼感激，普通礼物温暖感谢\n\
         \n\
         【事件指导】{instruction}\n\
         \n\
         【事件内容】{event_text}\n\
         \n\
         【之前的事件信息】{recent}\n\
         \n\
         作为{assistant_name}直接回应（{length}）："
    )
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_tag() {
        assert_eq!(
            classify_event("【弹幕消息】用户 Ann 发送了弹幕：hi"),
            EventClass::Danmaku
        );
        assert_eq!(classify_event("【大航海】用户 B 购买了 舰长"), EventClass::Guard);
        assert_eq!(classify_event("【礼物】用户 C 送出了 火箭"), EventClass::Gift);
        assert_eq!(
            classify_event("【付费留言】用户 D 发送了 30元 的付费留言：加油"),
            EventClass::SuperChat
        );
        assert_eq!(classify_event("【点赞】用户 E 为直播间点了 9 个赞"), EventClass::Like);
        assert_eq!(classify_event("【进入房间】用户 F 进入了直播间"), EventClass::RoomEnter);
        assert_eq!(classify_event("【直播开始】主播开始了直播"), EventClass::LiveStart);
        assert_eq!(classify_event("【直播结束】主播结束了直播"), EventClass::LiveEnd);
        assert_eq!(classify_event("随便什么"), EventClass::Mixed);
    }

    #[test]
    fn danmaku_gets_the_longer_budget() {
        assert_eq!(length_requirement(EventClass::Danmaku, false), "30-50字");
        assert_eq!(length_requirement(EventClass::Guard, false), "25-40字");
        assert_eq!(length_requirement(EventClass::Like, false), "20-35字");
    }

    #[test]
    fn only_high_value_gifts_get_the_tighter_budget() {
        assert_eq!(length_requirement(EventClass::Gift, true), "25-40字");
        assert_eq!(length_requirement(EventClass::Gift, false), "20-35字");
    }

    #[test]
    fn high_value_gift_detection_by_keyword() {
        assert!(is_high_value_gift("【礼物】用户 C 送出了 火箭（价值：100000）"));
        assert!(is_high_value_gift("【礼物】用户 C 送出了 2个 嘉年华（总价值：12000）"));
        assert!(!is_high_value_gift("【礼物】用户 C 送出了 小心心（价值：100）"));
    }

    #[test]
    fn gift_prompt_budget_follows_value_tier() {
        let awed = build_prompt("小七", "", "【礼物】用户 C 送出了 火箭（价值：100000）", &[]);
        assert!(awed.contains("25-40字"));
        assert!(awed.contains("高价值礼物"));

        let warm = build_prompt("小七", "", "【礼物】用户 C 送出了 小心心（价值：100）", &[]);
        assert!(warm.contains("20-35字"));
        assert!(!warm.contains("针对高价值礼物"));
    }

    #[test]
    fn prompt_contains_all_sections() {
        let prompt = build_prompt(
            "小七",
            "深夜电台直播间",
            "【弹幕消息】用户 Ann 发送了弹幕：hi",
            &["【点赞】用户 B 为直播间点了 3 个赞".to_string()],
        );

        assert!(prompt.contains("小七"));
        assert!(prompt.contains("深夜电台直播间"));
        assert!(prompt.contains("【事件内容】【弹幕消息】用户 Ann 发送了弹幕：hi"));
        assert!(prompt.contains("【点赞】用户 B 为直播间点了 3 个赞"));
        assert!(prompt.contains("30-50字"));
    }

    #[test]
    fn empty_memory_has_placeholder() {
        let prompt = build_prompt("小七", "", "【点赞】用户 E 点赞", &[]);
        assert!(prompt.contains("（暂无）"));
    }
}
