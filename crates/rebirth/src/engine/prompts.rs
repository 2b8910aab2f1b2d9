//! Prompt templates. Product copy is authored in Chinese; placeholders are
//! substituted with [`render`].

/// Node generation, hidden-effects edition: the model narrates one beat and
/// proposes three branches, each with engine-only effect deltas. Numbers are
/// banned from anything player-facing.
pub const NODE_PROMPT: &str = r#"
你是一个严格遵守指令的交互叙事引擎。你的任务是基于历史设定继续讲述当前小节的剧情，并提供 3 个可供玩家选择的分支。

【历史设定参考】
{history_context}

【创作要求】
1. 文本 220-320 字，画面感强，推进冲突或线索。
2. 选项必须自然流畅，不能是"标题+描述"的格式，而应该是完整的行动描述。
3. 选项中绝对禁止出现：百分比、数值、"成功率"、"风险"、"+/-"等任何量化表达。
4. 选项应该有创意、有趣、生动，避免死板正经的表述。
5. 必须返回 3 个不同风格的选项，且为每个选项提供"隐藏影响（effects）"供引擎使用：
   - delta_progress: int（范围建议：-3~+15）
   - delta_risk: int（范围建议：-5~+12）
   - delta_exposure: int（范围建议：-3~+10）
   - tags: string[]（可选）
6. 输出严格的 JSON 本体，不要使用 Markdown 代码块或多余文本。
7. 保持本章节画面连续性，使用下方的 continuity token。

【连续性令牌】
image_continuity_token: {image_token}

【选项格式示例】
正确："假装醉酒接近守卫，趁其不备夺取钥匙"
错误："潜入行动 - 利用夜色掩护潜入敌营"
错误："直接进攻 +10% 成功率"

【输出 JSON 模板】（仅示意，务必返回与此结构完全一致的对象）
{
  "text": "此处为本小节的剧情文本……",
  "choices": [
    {
      "option": "假装醉酒接近守卫，趁其不备夺取钥匙",
      "summary": "冒险但可能有效的潜入方式",
      "effects": {
        "delta_progress": 8,
        "delta_risk": 4,
        "delta_exposure": 2,
        "tags": ["stealth", "deception"]
      }
    },
    {
      "option": "贿赂看守，用金钱换取通行",
      "summary": "相对安全但消耗资源的方法",
      "effects": {
        "delta_progress": 5,
        "delta_risk": -1,
        "delta_exposure": 1,
        "tags": ["diplomacy", "resources"]
      }
    },
    {
      "option": "等待换班时机，从侧门绕行进入",
      "summary": "谨慎观察后的稳妥选择",
      "effects": {
        "delta_progress": 3,
        "delta_risk": -2,
        "delta_exposure": -1,
        "tags": ["patience", "observation"]
      }
    }
  ],
  "image_prompts": [
    "写实古风 阴影与烛光 人物特写 张力增强",
    "同风格备用分镜"
  ],
  "image_continuity_token": "{image_token}"
}
"#;

/// System preamble for node calls: JSON only, fixed key set, no scoring
/// fields ever.
pub const NODE_PREAMBLE: &str = "你是交互叙事引擎。严格只输出一个JSON对象，不含任何Markdown或额外文字。\
本次允许的顶层键：text, choices, image_prompts, image_continuity_token。\
其中 choices 为长度3的数组，每项仅包含 option, summary, effects(含 delta_progress, delta_risk, delta_exposure, 可选tags)。\
禁止输出 success_rate 或 success_rate_delta 等任何评分相关字段。";

/// One-shot JSON repair preamble, stricter than the node preamble.
pub const REPAIR_PREAMBLE: &str = "你是JSON修复器。严格只输出一个JSON对象，不含任何Markdown或额外文字。\
允许的顶层键：text, choices, image_prompts, image_continuity_token。\
choices 必须是长度为3的数组，每项仅包含 option(字符串)、summary(字符串)、effects(对象，含 delta_progress, delta_risk, delta_exposure 整数，可选 tags 字符串数组)。\
禁止输出 success_rate 或 success_rate_delta 等任何评分相关字段。";

pub const REPAIR_PROMPT: &str = r#"请将以下内容转换为严格的JSON对象，键只允许：text, choices, image_prompts, image_continuity_token。
要求：
- choices 必须是长度为3的数组；
- 每个choice对象必须包含 option(字符串)、summary(字符串)、effects(对象)；
- effects 对象必须包含 delta_progress(int)、delta_risk(int)、delta_exposure(int)，可选 tags(string[])；
- 仅输出纯JSON，不要Markdown代码块、不要额外文字。

原始内容如下：
<<<
{raw}
>>>
"#;

/// Level synopsis for prepare_start.
pub const PREPARE_LEVEL_PROMPT: &str = r#"
你是一名顶级的沉浸式关卡设计师。请根据用户的重生愿望与历史设定，生成第一关的结构化元信息。

【背景设定参考】
{history_context}

请严格遵守以下要求：
1. 生成一个简洁有力且符合愿望主题的【关卡标题】（不超过20字）。
2. 生成【关卡背景设定】（120-180字），融合时代氛围、主要人物关系、冲突前景。
3. 生成清晰可执行的【主线任务】（1句话，不超过30字），明确玩家第一关的核心目标。

用户重生愿望："{wish}"

请严格输出以下 JSON 格式，且：
- 不要输出任何多余文字（包括解释、前后缀、自然语言）；
- 不要使用 Markdown 代码块或围栏（例如 ``` 或 ```json）；
- 仅输出纯 JSON 字符串：
{
  "level_title": "标题",
  "background": "背景设定",
  "main_quest": "主线任务"
}
"#;

pub const PREPARE_LEVEL_PREAMBLE: &str = "你是关卡设计器。严格只输出一个JSON对象，不含Markdown或多余文字。\
只允许输出：level_title, background, main_quest 这些键。";

/// Chapter settlement: recap plus a hook for the next chapter.
pub const SETTLEMENT_PROMPT: &str = r#"
你是一个剧情总结器。请基于给定的历史时间线，输出本章的复盘与下一章的引子。

【时间线（从早到晚）】
{timeline_block}

【结果与评分】
- result: {result}
- grade: {grade}

【输出要求】
1. 仅输出一个 JSON 对象，不要包含任何多余文字或 Markdown 代码块。
2. 保持精炼有力，避免复述整段剧情原文，突出关键因果与代价。

【输出 JSON 模板】
{
  "chapter_summary": "80-140字，概述本章走向与内在逻辑",
  "timeline": [
    {"node": 1, "choice": "玩家的选择标题", "impact": "该选择的叙事化影响描述"}
  ],
  "key_impacts": ["关键转折1", "关键代价2"],
  "next_chapter_hook": "引人期待的下章引子（1句话）",
  "cover_image_prompt": "用于生成章末总结图的提示语"
}
"#;

pub const SETTLEMENT_PREAMBLE: &str = "你是JSON生成器。严格只输出一个JSON对象，不含Markdown或多余文字。\
只允许输出：chapter_summary, timeline, key_impacts, next_chapter_hook, cover_image_prompt 这些键。";

/// Substitute `{name}` placeholders. Templates contain literal JSON braces,
/// so only the listed placeholders are touched.
pub fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in substitutions {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
