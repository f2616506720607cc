//! Image reference typo correction.
//!
//! Matches image name and tag tokens against a fixed dictionary of known
//! confusables. Lookup is exact token substitution, not edit distance, so a
//! genuinely unknown image is never "corrected" into the wrong one.

use super::{Detect, DetectorContext};
use crate::issue::{Issue, Reason};
use crate::plan::{Action, Plan, Step};

/// Known-confusable image tokens and their corrections.
const TYPO_TABLE: &[(&str, &str)] = &[
    ("apline", "alpine"),
    ("latst", "latest"),
    ("lastest", "latest"),
    ("ubunut", "ubuntu"),
    ("ngnix", "nginx"),
    ("postgress", "postgres"),
    ("rediss", "redis"),
];

/// The dictionary typo token present in `image`, if any. Also used for
/// fingerprinting image pull failures.
pub fn find_typo_token(image: &str) -> Option<&'static str> {
    TYPO_TABLE
        .iter()
        .find(|(typo, _)| token_position(image, typo).is_some())
        .map(|(typo, _)| *typo)
}

/// Image reference with the first dictionary typo substituted, or `None`
/// when no table entry matches as a whole token.
pub fn correct_image(image: &str) -> Option<String> {
    for (typo, fix) in TYPO_TABLE {
        if let Some(pos) = token_position(image, typo) {
            let mut corrected = String::with_capacity(image.len());
            corrected.push_str(&image[..pos]);
            corrected.push_str(fix);
            corrected.push_str(&image[pos + typo.len()..]);
            return Some(corrected);
        }
    }
    None
}

/// Position of `token` in `s` bounded by non-alphanumeric characters (or the
/// string edges), so `latst` matches in `nginx:latst` but not in `latstest`.
fn token_position(s: &str, token: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut start = 0;
    while let Some(found) = s[start..].find(token) {
        let at = start + found;
        let end = at + token.len();
        let bounded_left = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let bounded_right = end == s.len() || !bytes[end].is_ascii_alphanumeric();
        if bounded_left && bounded_right {
            return Some(at);
        }
        start = at + 1;
    }
    None
}

pub struct ImageTypo;

impl Detect for ImageTypo {
    fn name(&self) -> &'static str {
        "image-typo"
    }

    fn detect(&self, issue: &Issue, _ctx: &DetectorContext) -> Option<Plan> {
        if issue.reason != Reason::ImagePullBackOff {
            return None;
        }
        let corrected = correct_image(&issue.image)?;
        let typo = find_typo_token(&issue.image).unwrap_or_default();
        Some(Plan::single(Step::for_issue(
            Action::PatchImage {
                image: corrected.clone(),
            },
            issue,
            format!(
                "image token '{typo}' is a known typo; '{}' corrected to '{corrected}'",
                issue.image
            ),
        )))
    }
}
