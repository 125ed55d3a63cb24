//! Feedback context builder for the next proposal.
//!
//! The context is a pure function of the requirement, the current project
//! snapshot and the ordered history.
//! Only the most recent failure is repeated in full; earlier attempts are
//! reduced to their failure class so the context stays bounded no matter how
//! many attempts ran.

use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::history::{AttemptRecord, FailureCounts};

const FEEDBACK_TEMPLATE: &str = include_str!("../prompts/feedback.md");

/// One summarized earlier attempt (class only, no diagnostic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EarlierAttempt {
    pub index: u32,
    pub class: &'static str,
}

/// The most recent failed attempt, repeated verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastFailure {
    pub index: u32,
    pub class: &'static str,
    pub diagnostic: String,
}

/// Deterministic digest of the history that feeds the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feedback {
    pub summary: FailureCounts,
    pub earlier: Vec<EarlierAttempt>,
    pub last: Option<LastFailure>,
}

/// Reduce the history to what the next proposal is allowed to see.
pub fn summarize(history: &[AttemptRecord]) -> Feedback {
    let summary = FailureCounts::from_history(history);
    let last_failed = history
        .iter()
        .rposition(|record| record.failure().is_some());

    let earlier = history
        .iter()
        .enumerate()
        .filter(|(pos, _)| Some(*pos) != last_failed)
        .filter_map(|(_, record)| {
            record.failure().map(|(class, _)| EarlierAttempt {
                index: record.index,
                class: class.as_str(),
            })
        })
        .collect();

    let last = last_failed.and_then(|pos| {
        let record = &history[pos];
        record.failure().map(|(class, diagnostic)| LastFailure {
            index: record.index,
            class: class.as_str(),
            diagnostic: diagnostic.to_string(),
        })
    });

    Feedback {
        summary,
        earlier,
        last,
    }
}

/// Renders proposal contexts from the requirement and prior attempts.
pub struct FeedbackBuilder {
    env: Environment<'static>,
    preamble: Option<String>,
}

impl FeedbackBuilder {
    pub fn new(preamble: Option<&str>) -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("feedback", FEEDBACK_TEMPLATE)
            .expect("feedback template should be valid");
        Self {
            env,
            preamble: preamble
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    /// Build the context for the next attempt.
    ///
    /// `snapshot` is the rendered project listing, placed after the
    /// requirement. With neither a snapshot nor a failed attempt this is the
    /// requirement itself (after the preamble, when one is configured).
    pub fn build(
        &self,
        requirement: &str,
        snapshot: Option<&str>,
        history: &[AttemptRecord],
    ) -> Result<String, minijinja::Error> {
        let feedback = summarize(history);
        let snapshot = snapshot.map(str::trim_end).filter(|s| !s.is_empty());
        if feedback.last.is_none() && snapshot.is_none() {
            return Ok(match &self.preamble {
                Some(preamble) => format!("{preamble}\n\n{requirement}"),
                None => requirement.to_string(),
            });
        }

        let template = self.env.get_template("feedback")?;
        let rendered = template.render(context! {
            preamble => self.preamble.as_deref(),
            requirement => requirement.trim(),
            snapshot => snapshot,
            summary => feedback.summary,
            earlier => feedback.earlier,
            last => feedback.last,
        })?;
        Ok(rendered.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{apply_failed, proposal_failed, validation_failed};

    #[test]
    fn first_attempt_context_is_raw_requirement() {
        let builder = FeedbackBuilder::new(None);
        let context = builder.build("Size the pump", None, &[]).expect("build");
        assert_eq!(context, "Size the pump");
    }

    #[test]
    fn first_attempt_context_keeps_preamble_first() {
        let builder = FeedbackBuilder::new(Some("You edit python design files."));
        let context = builder.build("Size the pump", None, &[]).expect("build");
        assert_eq!(context, "You edit python design files.\n\nSize the pump");
    }

    #[test]
    fn includes_last_diagnostic_verbatim_and_summary() {
        let history = vec![
            validation_failed(0, "D1: mass budget exceeded by 12 kg"),
            validation_failed(1, "D2: AssertionError: masse_g*1000 == masse_kg"),
        ];
        let builder = FeedbackBuilder::new(None);
        let context = builder
            .build("Keep mass under 100 kg", None, &history)
            .expect("build");

        assert!(context.contains("Keep mass under 100 kg"));
        assert!(context.contains("D2: AssertionError: masse_g*1000 == masse_kg"));
        assert!(!context.contains("D1: mass budget exceeded"));
        assert!(context.contains("2 previous attempt(s)"));
        assert!(context.contains("2 failed validation"));
        assert!(context.contains("- attempt 0: validation failed"));
    }

    #[test]
    fn requirement_precedes_feedback_sections() {
        let history = vec![apply_failed(0, "hunk did not match")];
        let builder = FeedbackBuilder::new(Some("PREAMBLE"));
        let context = builder.build("REQ", None, &history).expect("build");

        let preamble = context.find("PREAMBLE").expect("preamble");
        let requirement = context.find("REQ").expect("requirement");
        let summary = context.find("# Previous attempts").expect("summary");
        let last = context.find("hunk did not match").expect("diagnostic");
        assert!(preamble < requirement && requirement < summary && summary < last);
        assert!(context.contains("patch did not apply"));
    }

    #[test]
    fn snapshot_sits_between_requirement_and_feedback() {
        let snapshot = "## design.py\n\n```\nPUMP_HEAD_M = 25\n```\n";
        let builder = FeedbackBuilder::new(None);

        let first = builder.build("REQ", Some(snapshot), &[]).expect("build");
        assert_eq!(
            first,
            "# Requirement\n\nREQ\n\n# Project files\n\n\
             ## design.py\n\n```\nPUMP_HEAD_M = 25\n```"
        );

        let history = vec![validation_failed(0, "head 25 m < 30 m")];
        let next = builder.build("REQ", Some(snapshot), &history).expect("build");
        let requirement = next.find("REQ").expect("requirement");
        let files = next.find("PUMP_HEAD_M = 25").expect("snapshot");
        let summary = next.find("# Previous attempts").expect("summary");
        let last = next.find("head 25 m < 30 m").expect("diagnostic");
        assert!(requirement < files && files < summary && summary < last);
    }

    #[test]
    fn empty_snapshot_keeps_raw_requirement() {
        let builder = FeedbackBuilder::new(None);
        assert_eq!(builder.build("REQ", Some("\n"), &[]).expect("build"), "REQ");
    }

    #[test]
    fn summarize_counts_each_class_and_keeps_only_last_in_full() {
        let history = vec![
            proposal_failed(0, "rate limited"),
            apply_failed(1, "conflict in systems_core.py"),
            validation_failed(2, "NameError: PARAMS"),
        ];
        let feedback = summarize(&history);

        assert_eq!(feedback.summary.total, 3);
        assert_eq!(feedback.summary.proposal, 1);
        assert_eq!(feedback.summary.apply, 1);
        assert_eq!(feedback.summary.validation, 1);
        assert_eq!(
            feedback.earlier,
            vec![
                EarlierAttempt {
                    index: 0,
                    class: "proposal failed"
                },
                EarlierAttempt {
                    index: 1,
                    class: "patch did not apply"
                },
            ]
        );
        let last = feedback.last.expect("last failure");
        assert_eq!(last.index, 2);
        assert_eq!(last.diagnostic, "NameError: PARAMS");
    }

    #[test]
    fn context_is_deterministic() {
        let history = vec![validation_failed(0, "D1"), validation_failed(1, "D2")];
        let builder = FeedbackBuilder::new(None);
        let a = builder.build("REQ", None, &history).expect("build");
        let b = builder.build("REQ", None, &history).expect("build");
        assert_eq!(a, b);
    }
}
