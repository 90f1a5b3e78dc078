//! Custom filter expressions for routes.
//!
//! Hosts with a full query engine inject their own [`FilterEvaluator`].
//! [`SimpleFilter`] covers the common single-document cases:
//!
//! ```text
//! [tag[Journal]!prefix[Draft]]      all steps in a run must pass
//! [tag[Task]] [field:status[open]]  runs separated by spaces are OR-ed
//! [[Exact Title]]                   title literal
//! ```

use crate::document::Document;

/// Evaluates one filter expression against a single document.
///
/// A non-empty result means the document matches.
pub trait FilterEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, doc: &Document) -> Vec<String>;
}

/// Built-in evaluator for a small operator subset.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFilter;

#[derive(Debug, PartialEq, Eq)]
struct Step<'a> {
    negated: bool,
    operator: &'a str,
    suffix: Option<&'a str>,
    param: &'a str,
}

#[derive(Debug, PartialEq, Eq)]
enum Run<'a> {
    Title(&'a str),
    Steps(Vec<Step<'a>>),
}

fn parse(expression: &str) -> Option<Vec<Run<'_>>> {
    let mut runs = Vec::new();
    let mut rest = expression.trim();

    while !rest.is_empty() {
        let body = rest.strip_prefix('[')?;
        if let Some(literal) = body.strip_prefix('[') {
            let end = literal.find("]]")?;
            runs.push(Run::Title(&literal[..end]));
            rest = literal[end + 2..].trim_start();
            continue;
        }

        let mut steps = Vec::new();
        let mut cursor = body;
        loop {
            if let Some(after) = cursor.strip_prefix(']') {
                cursor = after;
                break;
            }
            let (negated, after_bang) = match cursor.strip_prefix('!') {
                Some(after) => (true, after),
                None => (false, cursor),
            };
            let open = after_bang.find('[')?;
            let name = &after_bang[..open];
            let after_open = &after_bang[open + 1..];
            let close = after_open.find(']')?;
            let (operator, suffix) = match name.split_once(':') {
                Some((op, suffix)) => (op, Some(suffix)),
                None => (name, None),
            };
            if operator.is_empty() {
                return None;
            }
            steps.push(Step {
                negated,
                operator,
                suffix,
                param: &after_open[..close],
            });
            cursor = &after_open[close + 1..];
        }

        if steps.is_empty() {
            return None;
        }
        runs.push(Run::Steps(steps));
        rest = cursor.trim_start();
    }

    Some(runs)
}

fn step_passes(step: &Step<'_>, doc: &Document) -> Option<bool> {
    let result = match step.operator {
        "tag" => doc.tags().iter().any(|tag| tag == step.param),
        "title" => doc.title() == step.param,
        "prefix" => doc.title().starts_with(step.param),
        "suffix" => doc.title().ends_with(step.param),
        "has" => doc.field(step.param).is_some_and(|value| !value.is_empty()),
        "field" => {
            let name = step.suffix?;
            doc.field(name).unwrap_or_default() == step.param
        }
        _ => return None,
    };
    Some(result != step.negated)
}

impl FilterEvaluator for SimpleFilter {
    fn evaluate(&self, expression: &str, doc: &Document) -> Vec<String> {
        let Some(runs) = parse(expression) else {
            crate::debug_event!("router", "unparsable filter", "{expression}");
            return Vec::new();
        };

        let matched = runs.iter().any(|run| match run {
            Run::Title(title) => doc.title() == *title,
            Run::Steps(steps) => steps.iter().all(|step| match step_passes(step, doc) {
                Some(passes) => passes,
                None => {
                    crate::debug_event!("router", "unknown filter operator", "{}", step.operator);
                    false
                }
            }),
        });

        if matched {
            vec![doc.title().to_string()]
        } else {
            Vec::new()
        }
    }
}
