//! Turn controller: prompt assembly, question pacing, and the guard
//! that keeps a non-deterministic model from ending the interview
//! before the turn floor is reached.
//!
//! Everything here is deterministic for identical inputs so tests can
//! replay transcripts exactly.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};

use crate::context::{InterviewContext, QuestionPlan};

/// Longest acknowledged clause echoed back to the candidate, in chars.
const ACK_CLAUSE_MAX_CHARS: usize = 60;

/// Default closing-language patterns, English and Chinese. This is a
/// heuristic list, configurable data rather than logic: pass your own
/// set to `ClosingPhrases::from_patterns` to extend it.
pub const DEFAULT_CLOSING_PATTERNS: &[&str] = &[
    r"(?i)that(?:'|’)?s all for today",
    r"(?i)we(?:'|’)?ll be in touch",
    r"(?i)this concludes (?:our|the) interview",
    r"(?i)thank you for (?:your time|coming|participating|joining)",
    r"(?i)(?:wrap|wrapping) (?:it |things )?up",
    r"(?i)end of (?:the |our )?interview",
    r"(?i)best of luck",
    r"(?i)good luck with",
    r"(?i)have a (?:great|good|nice|wonderful) (?:day|evening|one)",
    r"面试(?:到此|就到这里|到这里)(?:结束)?",
    r"今天的面试(?:就)?(?:到此|到这里)",
    r"感谢(?:你|您)(?:的)?(?:时间|参与|配合)",
    r"我们会(?:再|后续)(?:与|和)(?:你|您)联系",
    r"保持联系",
    r"祝(?:你|您)好运",
];

/// Ordered topic patterns for tailored fallback questions. First
/// match wins.
static TOPIC_QUESTIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)project|deliver|launch|ship|release|项目|交付|上线",
            "Walk me through the most challenging part of that project and what you personally owned.",
        ),
        (
            r"(?i)metric|growth|revenue|conversion|retention|kpi|增长|指标|转化",
            "Which metric moved the most as a result, and how did you measure that impact?",
        ),
        (
            r"(?i)team|collaborat|stakeholder|cross-functional|团队|协作|沟通",
            "Tell me about a disagreement inside that team and how you worked through it.",
        ),
        (
            r"(?i)challeng|risk|fail|difficult|setback|挑战|风险|失败|困难",
            "What was the biggest risk in that situation, and how did you handle it?",
        ),
        (
            r"(?i)user|customer|feedback|用户|客户|反馈",
            "How did user feedback change your approach there?",
        ),
        (
            r"(?i)architect|technical|design|system|scal|infra|架构|技术|系统|设计",
            "Could you go one level deeper into the technical design and the trade-offs you made?",
        ),
    ]
    .into_iter()
    .map(|(pattern, question)| {
        (
            Regex::new(pattern).expect("built-in topic pattern compiles"),
            question,
        )
    })
    .collect()
});

/// Generic questions used when nothing topical matches, indexed by
/// turn count so consecutive fallbacks do not repeat.
const GENERIC_QUESTIONS: [&str; 5] = [
    "Could you tell me more about your most recent role and what you focused on?",
    "What accomplishment are you most proud of, and what made it hard?",
    "Describe a time you had to learn something new quickly. How did you go about it?",
    "What would your teammates say is your biggest strength?",
    "Where do you most want to grow in your next role?",
];

/// Compiled closing-language heuristic. False positives on short
/// genuine acknowledgements are possible; the pattern list is data,
/// not an exhaustive guarantee.
#[derive(Debug, Clone)]
pub struct ClosingPhrases {
    set: RegexSet,
}

impl ClosingPhrases {
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            set: RegexSet::new(patterns)?,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.set.is_match(text)
    }
}

impl Default for ClosingPhrases {
    fn default() -> Self {
        Self::from_patterns(DEFAULT_CLOSING_PATTERNS)
            .expect("built-in closing patterns compile")
    }
}

/// Builds prompts and rewrites assistant output so the interview
/// always moves forward. Holds no per-session state.
#[derive(Debug, Clone, Default)]
pub struct TurnController {
    closing: ClosingPhrases,
}

/// Core-question index for a given turn count:
/// `min(len - 1, max(0, turns - 1))`.
fn current_question_index(user_turn_count: u32, len: usize) -> usize {
    let turn = user_turn_count.saturating_sub(1) as usize;
    turn.min(len.saturating_sub(1))
}

impl TurnController {
    pub fn new(closing: ClosingPhrases) -> Self {
        Self { closing }
    }

    /// Whether the text reads as closing language. Past the turn
    /// floor this marks the normal end of the interview.
    pub fn is_closing(&self, text: &str) -> bool {
        self.closing.matches(text)
    }

    /// Interviewer persona plus everything the model needs about the
    /// candidate, the job, and the question plan.
    pub fn build_system_prompt(&self, context: &InterviewContext) -> String {
        let plan = &context.question_plan;
        let mut prompt = String::new();
        prompt.push_str(
            "You are a professional, friendly AI interviewer conducting a live interview. \
             Stay in character at all times, keep the conversation natural, and never \
             mention that you are following a script.\n\n",
        );
        prompt.push_str(&format!("Candidate: {}\n", context.candidate.name));
        prompt.push_str(&format!("Position: {}\n", context.job.title));
        prompt.push_str(&format!("Interview type: {}\n", context.interview_type.as_str()));
        prompt.push_str(&format!("Job description: {}\n", context.job.description));
        if !context.job.requirements.is_empty() {
            prompt.push_str("Key requirements:\n");
            for requirement in &context.job.requirements {
                prompt.push_str(&format!("- {requirement}\n"));
            }
        }
        if !plan.core_questions.is_empty() {
            prompt.push_str("\nCore questions to cover, in order:\n");
            for (i, question) in plan.core_questions.iter().enumerate() {
                prompt.push_str(&format!("{}. {question}\n", i + 1));
            }
        }
        if !plan.followups.is_empty() {
            prompt.push_str("\nFollow-up angles you may use:\n");
            for followup in &plan.followups {
                prompt.push_str(&format!("- {followup}\n"));
            }
        }
        prompt
    }

    /// Per-turn instruction block: where we are in the plan and why
    /// the model may not wrap up yet.
    pub fn build_turn_flow_directive(
        &self,
        user_turn_count: u32,
        min_user_turns_before_wrap: u32,
        plan: &QuestionPlan,
    ) -> String {
        let mut directive = String::new();
        directive.push_str(&format!(
            "Turn status: the candidate has answered {user_turn_count} time(s) so far.\n"
        ));
        if user_turn_count < min_user_turns_before_wrap {
            directive.push_str(&format!(
                "You MUST NOT close, summarize, or say goodbye before the candidate has \
                 answered at least {min_user_turns_before_wrap} times. Keep the interview going.\n"
            ));
        }
        if !plan.core_questions.is_empty() {
            let current = current_question_index(user_turn_count, plan.core_questions.len());
            directive.push_str(&format!(
                "Current core question: {}\n",
                plan.core_questions[current]
            ));
            if let Some(next) = plan.core_questions.get(current + 1) {
                directive.push_str(&format!("Next core question: {next}\n"));
            }
        }
        if !plan.followups.is_empty() {
            let hint = &plan.followups[user_turn_count as usize % plan.followups.len()];
            directive.push_str(&format!("Follow-up angle if useful: {hint}\n"));
        }
        directive.push_str(
            "Output shape: briefly acknowledge the candidate's answer, then ask exactly \
             one question. Keep it short and conversational.",
        );
        directive
    }

    /// Gatekeeper over raw model output. Empty output, or closing
    /// language before the turn floor, is replaced with a generated
    /// continuation; anything else passes through untouched.
    pub fn post_process_assistant_text(
        &self,
        ai_text: &str,
        last_user_text: &str,
        user_turn_count: u32,
        min_user_turns_before_wrap: u32,
        plan: &QuestionPlan,
    ) -> String {
        let trimmed = ai_text.trim();
        if trimmed.is_empty() {
            return self.build_continuation_question(last_user_text, user_turn_count, plan);
        }
        if user_turn_count < min_user_turns_before_wrap && self.closing.matches(trimmed) {
            tracing::debug!(
                user_turn_count,
                min_user_turns_before_wrap,
                "assistant tried to close early, substituting continuation"
            );
            return self.build_continuation_question(last_user_text, user_turn_count, plan);
        }
        trimmed.to_string()
    }

    /// Next unused core question, else a follow-up hint, else the
    /// pure fallback generator.
    pub fn build_continuation_question(
        &self,
        last_user_text: &str,
        user_turn_count: u32,
        plan: &QuestionPlan,
    ) -> String {
        if !plan.core_questions.is_empty() {
            let next = current_question_index(user_turn_count, plan.core_questions.len()) + 1;
            if let Some(question) = plan.core_questions.get(next) {
                return format!("Let's keep going. {question}");
            }
        }
        if !plan.followups.is_empty() {
            let hint = &plan.followups[user_turn_count as usize % plan.followups.len()];
            return format!("Before we move on, one more thing: {hint}");
        }
        generate_fallback_text(last_user_text, user_turn_count)
    }
}

/// Pure fallback generator: acknowledge the first clause of the
/// candidate's last answer, then ask either a topic-matched question
/// or a generic one indexed by turn count. Identical inputs always
/// produce identical output.
pub fn generate_fallback_text(last_user_text: &str, user_turn_count: u32) -> String {
    let acknowledgement = first_clause(last_user_text);
    let lead = if acknowledgement.is_empty() {
        String::new()
    } else {
        format!("You mentioned \"{acknowledgement}\". ")
    };

    for (pattern, question) in TOPIC_QUESTIONS.iter() {
        if pattern.is_match(last_user_text) {
            return format!("{lead}{question}");
        }
    }

    let index = (user_turn_count.saturating_sub(1) as usize).min(GENERIC_QUESTIONS.len() - 1);
    format!("{lead}{}", GENERIC_QUESTIONS[index])
}

/// First clause of an utterance, truncated on a char boundary.
fn first_clause(text: &str) -> String {
    let clause = text
        .split(['.', '!', '?', ',', ';', '。', '！', '？', '，', '；'])
        .next()
        .unwrap_or("")
        .trim();
    if clause.chars().count() <= ACK_CLAUSE_MAX_CHARS {
        clause.to_string()
    } else {
        let truncated: String = clause.chars().take(ACK_CLAUSE_MAX_CHARS).collect();
        format!("{}...", truncated.trim_end())
    }
}
