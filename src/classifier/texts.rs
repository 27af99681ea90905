//! Canned reply fragments: blessing suffixes for thank-you lines, tiered
//! like-thanks templates, and the rotating hint appended to room-enter
//! welcomes.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::voices::VoiceCatalog;

pub(crate) const BLESSINGS: [&str; 12] = [
    "祝老板天天开心，笑口常开",
    "老板好运加持，喜上眉梢",
    "老板开心指数爆表，心情超好",
    "老板福运连连，事事顺心",
    "祝老板笑容常在，阳光满满",
    "老板星光加冕，魅力值拉满",
    "祝一切顺利，心想事成",
    "赞赞赞，掌声送给老板",
    "老板今天一定大吉大利",
    "老板快乐环绕，活力满满",
    "老板喜气腾腾，步步高升",
    "老板元气满满，笑容满满",
];

/// Random blessing suffix for thank-you replies.
pub fn random_blessing() -> &'static str {
    let mut rng = rand::thread_rng();
    BLESSINGS.choose(&mut rng).unwrap_or(&BLESSINGS[0])
}

// ── Like-thanks templates ──────────────────────────────────────────
//
// Three tiers keyed by the user's like streak: plain thanks, combo
// (2-4 consecutive events) and super-combo (5 or more). `{user}` is
// substituted with the sender's display name.

pub(crate) const LIKE_TEMPLATES: [&str; 12] = [
    "感谢{user}的点赞！",
    "谢谢{user}的支持！",
    "感谢{user}给的赞！",
    "感谢{user}的点赞，你真是太棒了！",
    "谢谢{user}的点赞，有你真好！",
    "哇！{user}给了个赞，爱你哟！",
    "嘻嘻，{user}点赞了，么么哒！",
    "感谢{user}的点赞，你的支持是我最大的动力！",
    "谢谢{user}的点赞，你的拇指真给力！",
    "感谢{user}的点赞，祝你天天好心情！",
    "感谢{user}的点赞，让我们一起加油！",
    "感谢{user}的点赞，你让直播间更有活力！",
];

pub(crate) const COMBO_LIKE_TEMPLATES: [&str; 8] = [
    "哇！{user}连续点赞，太给力了！",
    "{user}的连击点赞，简直是点赞狂魔！",
    "感谢{user}的疯狂点赞，你太热情了！",
    "{user}连续点赞，手速真快！",
    "哇塞！{user}的连击点赞，爱死你了！",
    "感谢{user}的连续支持，你真是我的小粉丝！",
    "{user}点赞不停，简直是点赞机器！",
    "哇！{user}的连击，这节奏太棒了！",
];

pub(crate) const SUPER_COMBO_TEMPLATES: [&str; 5] = [
    "天哪！{user}的超级连击，你是点赞之王！",
    "哇！{user}疯狂点赞，简直是点赞风暴！",
    "感谢{user}的超级连击，你太疯狂了！",
    "{user}的点赞连击，创造了新纪录！",
    "哇塞！{user}的超级连击，你是点赞大神！",
];

/// Random like-thanks line for the tier the streak has reached.
pub fn like_thanks(user: &str, streak: u32) -> String {
    let mut rng = rand::thread_rng();
    let template = if streak >= 5 {
        SUPER_COMBO_TEMPLATES
            .choose(&mut rng)
            .unwrap_or(&SUPER_COMBO_TEMPLATES[0])
    } else if streak >= 2 {
        COMBO_LIKE_TEMPLATES
            .choose(&mut rng)
            .unwrap_or(&COMBO_LIKE_TEMPLATES[0])
    } else {
        LIKE_TEMPLATES.choose(&mut rng).unwrap_or(&LIKE_TEMPLATES[0])
    };
    template.replace("{user}", user)
}

/// Rotating hint line for room-enter welcomes. Three strategies: plain
/// introduction, voice recommendation, announcement pointer.
pub fn enter_hint(assistant_name: &str, catalog: &VoiceCatalog) -> String {
    let mut rng = rand::thread_rng();
    match rng.gen_range(0..3) {
        0 => format!(
            "你好呀，我是这里的弹幕播报员{assistant_name}，你可以试试发送弹幕:换，可以切换我为你的播报音色。"
        ),
        1 => {
            let picks = catalog.random_sample(3);
            if picks.is_empty() {
                return format!("你好，我是{assistant_name}。如果不喜欢现在的声音，可以发送“换音色”试试哦。");
            }
            let names: Vec<&str> = picks.iter().map(|v| v.name.as_str()).collect();
            match rng.gen_range(0..3) {
                0 => format!(
                    "你好，我是{assistant_name}。如果不喜欢现在的声音，可以发送“换音色”试试哦。"
                ),
                1 => format!(
                    "你好呀，我是可以变声的{assistant_name}，试试发送“换 {}”来改变我的声音吧。",
                    names[0]
                ),
                _ => format!(
                    "你好呀，我有好多有趣的声音，比如{}，快来体验一下自定义音色吧。",
                    names.join("、")
                ),
            }
        }
        _ => {
            let lines = [
                format!("你好，我是{assistant_name}。想要更多个性化设置吗？看看直播间公告，了解如何自定义我的声音。"),
                "你好！发送弹幕就能播报。记得查看直播间公告，解锁更多隐藏玩法哦。".to_string(),
                format!("你好呀，我是{assistant_name}。除了播报弹幕，我还有很多本领，详情请看直播间简介。"),
            ];
            lines
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| lines[0].clone())
        }
    }
}
