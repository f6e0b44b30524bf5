//! Placeholder substitution for subject and body templates.
//!
//! A placeholder is `{Column}`. Substitution is a single left-to-right scan:
//! each token is looked up once in the row and substituted values are never
//! scanned again, so a cell containing `{Other}` is emitted verbatim. Unknown
//! placeholders stay in the output unchanged. Values are not HTML-escaped.

use crate::types::RecipientRow;

// ============================================================================
// Renderer trait
// ============================================================================

pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, row: &RecipientRow) -> String;
}

// ============================================================================
// PlaceholderRenderer
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl Renderer for PlaceholderRenderer {
    fn render(&self, template: &str, row: &RecipientRow) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];

            // The token ends at the first `}` unless another `{` comes first,
            // in which case this brace is literal text.
            let close = after_open.find('}');
            let nested = after_open.find('{');
            match close {
                Some(close) if nested.is_none_or(|n| n > close) => {
                    let name = &after_open[..close];
                    match row.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after_open[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after_open;
                }
            }
        }

        out.push_str(rest);
        out
    }
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

/// A template rendered for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
}

impl Template {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn render_for<R: Renderer + ?Sized>(&self, renderer: &R, row: &RecipientRow) -> Rendered {
        Rendered {
            subject: renderer.render(&self.subject, row),
            body: renderer.render(&self.body, row),
        }
    }
}
