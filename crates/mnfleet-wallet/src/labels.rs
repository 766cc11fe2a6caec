//! ---
//! mnf_section: "02-wallet"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Label generation from naming schemes."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use mnfleet_common::{Label, ValidationError};

/// Expand the `#` run in `scheme` with `iterator`, zero-padded to the run's
/// width (`"COIN-MN###"`, 7 -> `"COIN-MN007"`).
///
/// An iterator with more digits than the placeholder is rejected with
/// [`ValidationError::LabelOverflow`] rather than truncated.
pub fn generate_label(scheme: &str, iterator: u64) -> Result<Label, ValidationError> {
    let start = scheme
        .find('#')
        .ok_or_else(|| ValidationError::MissingPlaceholder {
            scheme: scheme.to_owned(),
        })?;
    let width = scheme[start..].bytes().take_while(|b| *b == b'#').count();
    let (prefix, rest) = scheme.split_at(start);
    let suffix = &rest[width..];
    if suffix.contains('#') {
        return Err(ValidationError::InvalidLabel {
            value: scheme.to_owned(),
            reason: "label scheme must contain a single '#' run",
        });
    }

    let digits = iterator.to_string();
    if digits.len() > width {
        return Err(ValidationError::LabelOverflow {
            scheme: scheme.to_owned(),
            iterator,
            width,
            digits: digits.len(),
        });
    }
    format!("{prefix}{digits:0>width$}{suffix}").parse()
}
