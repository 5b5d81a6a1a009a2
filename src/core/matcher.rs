//! Tag matching engine
//!
//! Decides which rules an image belongs to, whether a tag is an upgrade
//! over what is running, and which local image a reconcile should deploy.

use regex::Regex;
use semver::Version;
use std::cmp::Ordering;

use crate::models::config::DeployRule;
use crate::models::errors::{AppError, AppResult};
use crate::models::types::{normalize_repository, ImageRef, ImageSummary};

/// Anchored glob over image tags (`*` any run, `?` one character)
#[derive(Debug, Clone)]
pub struct TagPattern {
    glob: String,
    regex: Regex,
}

impl TagPattern {
    pub fn new(glob: &str) -> AppResult<Self> {
        if glob.is_empty() {
            return Err(AppError::invalid_config("Tag pattern must not be empty"));
        }

        let mut pattern = String::with_capacity(glob.len() + 8);
        pattern.push('^');
        for c in glob.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| AppError::invalid_config(format!("Bad tag pattern {}: {}", glob, e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.regex.is_match(tag)
    }

    /// True when the pattern names exactly one tag
    pub fn is_literal(&self) -> bool {
        !self.glob.contains(['*', '?'])
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

/// Parse a tag as a version: one leading `v` is allowed and missing
/// minor/patch components are treated as zero (`v2` == `2.0.0`).
pub fn parse_version(tag: &str) -> Option<Version> {
    let bare = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
    if let Ok(version) = Version::parse(bare) {
        return Some(version);
    }

    // Pad only the numeric core; pre-release/build suffixes stay attached
    let split = bare.find(['-', '+']).unwrap_or(bare.len());
    let (core, rest) = bare.split_at(split);
    let padded = match core.split('.').count() {
        1 => format!("{}.0.0{}", core, rest),
        2 => format!("{}.0{}", core, rest),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

/// Whether `candidate` should replace `current`.
///
/// An unparseable current tag never blocks an upgrade; an unparseable
/// candidate never counts as one.
pub fn is_upgrade(current_tag: &str, candidate_tag: &str) -> bool {
    match (parse_version(current_tag), parse_version(candidate_tag)) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(current), Some(candidate)) => candidate > current,
    }
}

/// Whether `rule` wants `repository:tag`, given its precompiled parts
fn rule_accepts(rule: &DeployRule, rule_repository: &str, pattern: &TagPattern, repository: &str, tag: &str) -> bool {
    normalize_repository(repository) == rule_repository
        && pattern.matches(tag)
        && (!rule.semver_only || parse_version(tag).is_some())
}

struct CompiledRule {
    rule: DeployRule,
    repository: String,
    pattern: TagPattern,
}

impl CompiledRule {
    fn new(rule: DeployRule) -> AppResult<Self> {
        Ok(Self {
            repository: normalize_repository(&rule.repository),
            pattern: TagPattern::new(&rule.tag_pattern)?,
            rule,
        })
    }

    fn accepts(&self, repository: &str, tag: &str) -> bool {
        rule_accepts(&self.rule, &self.repository, &self.pattern, repository, tag)
    }
}

/// Rule lookup over the enabled rules of a config
pub struct RuleMatcher {
    rules: Vec<CompiledRule>,
}

impl RuleMatcher {
    pub fn new<'a>(rules: impl IntoIterator<Item = &'a DeployRule>) -> AppResult<Self> {
        let rules = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .map(|rule| CompiledRule::new(rule.clone()))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Rules that want this image
    pub fn matching(&self, image: &ImageRef) -> Vec<&DeployRule> {
        self.rules
            .iter()
            .filter(|c| c.accepts(&image.repository, &image.tag))
            .map(|c| &c.rule)
            .collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = &DeployRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Best local image for a rule: highest version for semver rules,
/// otherwise the most recently created (ties go to the larger tag).
pub fn select_candidate<'i>(rule: &DeployRule, images: &'i [ImageSummary]) -> Option<&'i ImageSummary> {
    let rule_repository = normalize_repository(&rule.repository);
    let pattern = TagPattern::new(&rule.tag_pattern).ok()?;

    let candidates = images
        .iter()
        .filter(|image| rule_accepts(rule, &rule_repository, &pattern, &image.repository, &image.tag));

    if rule.semver_only {
        candidates.max_by(|a, b| {
            parse_version(&a.tag)
                .cmp(&parse_version(&b.tag))
                .then_with(|| a.tag.cmp(&b.tag))
        })
    } else {
        candidates.max_by(|a, b| match (a.created_at, b.created_at) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.tag.cmp(&b.tag)),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => a.tag.cmp(&b.tag),
        })
    }
}
