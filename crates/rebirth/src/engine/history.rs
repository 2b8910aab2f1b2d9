//! History profiles: the wish-keyed lookup that anchors a run in a concrete
//! era, persona set, and list of canonical events.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryProfile {
    pub name: String,
    pub era: String,
    pub personas: Vec<String>,
    pub anchors: Vec<String>,
    pub primary_conflicts: Vec<String>,
    pub recommended_chapter_count: u32,
}

impl HistoryProfile {
    /// Render the profile as the context block injected into prompts.
    pub fn to_context_block(&self) -> String {
        [
            format!("角色定位：{}", self.name),
            format!("所属时代：{}", self.era),
            format!("人物特质：{}", self.personas.join("；")),
            format!("关键历史锚点：{}", self.anchors.join("；")),
            format!("主要矛盾：{}", self.primary_conflicts.join("；")),
            format!("推荐章节总数：至少 {} 章", self.recommended_chapter_count),
        ]
        .join("\n")
    }
}

fn profile(
    name: &str,
    era: &str,
    personas: &[&str],
    anchors: &[&str],
    conflicts: &[&str],
    chapters: u32,
) -> HistoryProfile {
    HistoryProfile {
        name: name.to_string(),
        era: era.to_string(),
        personas: personas.iter().map(|s| s.to_string()).collect(),
        anchors: anchors.iter().map(|s| s.to_string()).collect(),
        primary_conflicts: conflicts.iter().map(|s| s.to_string()).collect(),
        recommended_chapter_count: chapters,
    }
}

static HISTORICAL_FIGURES: Lazy<Vec<HistoryProfile>> = Lazy::new(|| {
    vec![
        profile(
            "李世民",
            "唐朝",
            &[
                "大唐第二位皇帝，政治与军事统筹的枭雄",
                "玄武门之变的策划者，善于审时度势",
            ],
            &[
                "少年击败突厥的战功",
                "玄武门之变",
                "贞观之治的制度改革",
                "对魏征等贤臣的纳谏",
            ],
            &[
                "如何解决兄弟间的皇位之争",
                "平衡开国功臣与新贵之间的权力",
                "边疆危机与突厥威胁",
            ],
            12,
        ),
        profile(
            "项羽",
            "楚汉之争",
            &["西楚霸王，力拔山兮气盖世", "悍勇无双却多疑的统帅"],
            &["巨鹿之战", "鸿门宴", "西楚建国与制度", "垓下之围"],
            &[
                "如何稳固西楚政权",
                "与刘邦之间的权谋博弈",
                "军心士气和战略抉择",
            ],
            10,
        ),
        profile(
            "刘邦",
            "楚汉之争",
            &["汉高祖，善用人、善忍辱的草根帝王", "外圆内方的政治老狐狸"],
            &["反秦起义", "鸿门宴", "韩信拜将", "楚汉决战"],
            &["如何整合各路义军", "收服天下豪杰", "与项羽的战略对抗"],
            11,
        ),
    ]
});

/// Deterministic profile for a wish: a known figure when the wish mentions
/// one, otherwise the generic themed fallback carrying the wish as the name.
pub fn build_history_profile(wish: &str) -> HistoryProfile {
    let wish = wish.trim();
    for candidate in HISTORICAL_FIGURES.iter() {
        if wish.contains(candidate.name.as_str()) {
            return candidate.clone();
        }
    }

    profile(
        if wish.is_empty() { "未知的历史人物" } else { wish },
        "历史长河",
        &["历史长河中的关键角色"],
        &["寻找该人物或时代的经典事件"],
        &["如何改变已知的历史节点"],
        9,
    )
}

/// Everything prompt assembly needs about the wish's setting.
pub struct PromptContext {
    pub profile: HistoryProfile,
    pub context_block: String,
}

pub fn build_prompt_context(wish: &str) -> PromptContext {
    let profile = build_history_profile(wish);
    let context_block = profile.to_context_block();
    PromptContext {
        profile,
        context_block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_figure_matches_by_substring() {
        let profile = build_history_profile("重生之我是李世民");
        assert_eq!(profile.name, "李世民");
        assert_eq!(profile.era, "唐朝");
        assert_eq!(profile.recommended_chapter_count, 12);
    }

    #[test]
    fn unknown_wish_gets_generic_theme() {
        let profile = build_history_profile("中世纪骑士");
        assert_eq!(profile.name, "中世纪骑士");
        assert_eq!(profile.era, "历史长河");
        assert_eq!(profile.recommended_chapter_count, 9);
    }

    #[test]
    fn context_block_lists_anchors() {
        let context = build_prompt_context("项羽");
        assert!(context.context_block.contains("鸿门宴"));
        assert!(context.context_block.contains("至少 10 章"));
    }
}
