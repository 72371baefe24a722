//! Core domain model for BountyPing: programs, their identity and fingerprint,
//! scrape audit records, and the change sets produced by reconciliation.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const DEFAULT_CURRENCY: &str = "USD";

/// Composite identity of a program. Slugs are platform-assigned and stable.
/// Both parts are trimmed and lowercased, so `Acme` and `acme` name the same
/// program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramKey {
    pub platform: String,
    pub slug: String,
}

impl ProgramKey {
    pub fn new(platform: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            platform: normalize_identity(platform.into()),
            slug: normalize_identity(slug.into()),
        }
    }

    /// Deterministic row id; agrees with the `(platform, slug)` unique key.
    pub fn program_id(&self) -> Uuid {
        let source = format!("bountyping:{}:{}", self.platform, self.slug);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
    }
}

fn normalize_identity(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.len() == value.len() && !trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        value
    } else {
        trimmed.to_ascii_lowercase()
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform, self.slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    #[default]
    Active,
    Removed,
}

impl ProgramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Normalized handoff contract from platform adapters into the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDraft {
    pub platform: String,
    pub slug: String,
    pub name: String,
    pub url: String,
    pub offers_bounties: bool,
    pub bounty_min: Option<i64>,
    pub bounty_max: Option<i64>,
    pub currency: String,
    pub asset_types: BTreeSet<String>,
    pub assets: Vec<String>,
    pub accepts_submissions: bool,
    pub managed: bool,
    pub launched_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub raw: Option<JsonValue>,
}

impl ProgramDraft {
    pub fn new(
        platform: impl Into<String>,
        slug: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            platform: platform.into(),
            slug: slug.into(),
            name: name.into(),
            url: url.into(),
            offers_bounties: true,
            bounty_min: None,
            bounty_max: None,
            currency: DEFAULT_CURRENCY.to_string(),
            asset_types: BTreeSet::new(),
            assets: Vec::new(),
            accepts_submissions: true,
            managed: false,
            launched_at: None,
            fetched_at,
            raw: None,
        }
    }

    pub fn key(&self) -> ProgramKey {
        ProgramKey::new(self.platform.clone(), self.slug.clone())
    }

    pub fn fingerprint(&self) -> String {
        FingerprintParts {
            name: &self.name,
            url: &self.url,
            offers_bounties: self.offers_bounties,
            bounty_min: self.bounty_min,
            bounty_max: self.bounty_max,
            currency: &self.currency,
            asset_types: &self.asset_types,
            assets: &self.assets,
        }
        .digest()
    }
}

/// The change-relevant fields of a program. Timestamps, status and the raw
/// payload are deliberately absent.
struct FingerprintParts<'a> {
    name: &'a str,
    url: &'a str,
    offers_bounties: bool,
    bounty_min: Option<i64>,
    bounty_max: Option<i64>,
    currency: &'a str,
    asset_types: &'a BTreeSet<String>,
    assets: &'a [String],
}

impl FingerprintParts<'_> {
    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        write_part(&mut hasher, "name", self.name.trim().as_bytes());
        write_part(&mut hasher, "url", self.url.trim().as_bytes());
        write_part(
            &mut hasher,
            "offers_bounties",
            if self.offers_bounties { b"1" } else { b"0" },
        );
        write_part(&mut hasher, "bounty_min", optional_amount(self.bounty_min).as_bytes());
        write_part(&mut hasher, "bounty_max", optional_amount(self.bounty_max).as_bytes());
        write_part(
            &mut hasher,
            "currency",
            self.currency.trim().to_ascii_uppercase().as_bytes(),
        );

        let asset_types = self
            .asset_types
            .iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .collect::<BTreeSet<_>>();
        write_part(&mut hasher, "asset_types", &(asset_types.len() as u64).to_be_bytes());
        for asset_type in &asset_types {
            write_part(&mut hasher, "asset_type", asset_type.as_bytes());
        }

        let assets = self
            .assets
            .iter()
            .map(|a| a.trim().to_string())
            .collect::<BTreeSet<_>>();
        write_part(&mut hasher, "assets", &(assets.len() as u64).to_be_bytes());
        for asset in &assets {
            write_part(&mut hasher, "asset", asset.as_bytes());
        }

        hex::encode(hasher.finalize())
    }
}

fn write_part(hasher: &mut Sha256, label: &str, value: &[u8]) {
    hasher.update(label.as_bytes());
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}

fn optional_amount(value: Option<i64>) -> String {
    match value {
        Some(v) => format!("some:{v}"),
        None => "none".to_string(),
    }
}

/// A bounty program as currently known to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub platform: String,
    pub slug: String,
    pub name: String,
    pub url: String,
    pub offers_bounties: bool,
    pub bounty_min: Option<i64>,
    pub bounty_max: Option<i64>,
    pub currency: String,
    pub asset_types: BTreeSet<String>,
    pub assets: Vec<String>,
    pub accepts_submissions: bool,
    pub managed: bool,
    pub status: ProgramStatus,
    pub launched_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub fingerprint: String,
    pub raw: Option<JsonValue>,
}

impl Program {
    /// Build the candidate row for a freshly observed draft. Both timestamps
    /// start at `observed_at`; stores keep the older `first_seen` on update.
    pub fn from_draft(draft: ProgramDraft, observed_at: DateTime<Utc>) -> Self {
        let fingerprint = draft.fingerprint();
        let key = draft.key();
        Self {
            id: key.program_id(),
            platform: key.platform,
            slug: key.slug,
            name: draft.name,
            url: draft.url,
            offers_bounties: draft.offers_bounties,
            bounty_min: draft.bounty_min,
            bounty_max: draft.bounty_max,
            currency: draft.currency,
            asset_types: draft.asset_types,
            assets: draft.assets,
            accepts_submissions: draft.accepts_submissions,
            managed: draft.managed,
            status: ProgramStatus::Active,
            launched_at: draft.launched_at,
            first_seen: observed_at,
            last_updated: observed_at,
            fingerprint,
            raw: draft.raw,
        }
    }

    pub fn key(&self) -> ProgramKey {
        ProgramKey::new(self.platform.clone(), self.slug.clone())
    }

    pub fn compute_fingerprint(&self) -> String {
        FingerprintParts {
            name: &self.name,
            url: &self.url,
            offers_bounties: self.offers_bounties,
            bounty_min: self.bounty_min,
            bounty_max: self.bounty_max,
            currency: &self.currency,
            asset_types: &self.asset_types,
            assets: &self.assets,
        }
        .digest()
    }

    /// Replace `existing`'s content with `self` while keeping the stored
    /// identity, the original `first_seen`, and a non-decreasing `last_updated`.
    pub fn superseding(mut self, existing: &Program) -> Program {
        self.id = existing.id;
        self.first_seen = existing.first_seen.min(self.first_seen);
        self.last_updated = existing.last_updated.max(self.last_updated);
        if self.launched_at.is_none() {
            self.launched_at = existing.launched_at;
        }
        self
    }

    pub fn is_vdp_only(&self) -> bool {
        !self.offers_bounties
    }

    /// Highest advertised payout, used to rank highlights.
    pub fn bounty_ceiling(&self) -> Option<i64> {
        if self.is_vdp_only() {
            return None;
        }
        self.bounty_max.or(self.bounty_min)
    }

    pub fn bounty_range(&self) -> String {
        if self.is_vdp_only() {
            return "No bounty (VDP)".to_string();
        }
        match (self.bounty_min, self.bounty_max) {
            (Some(min), Some(max)) => format!("{} - {}", format_usd(min), format_usd(max)),
            (None, Some(max)) => format!("Up to {}", format_usd(max)),
            (Some(min), None) => format!("From {}", format_usd(min)),
            (None, None) => "Bounty available".to_string(),
        }
    }

    /// Human-readable differences between `self` and a newer version.
    pub fn field_changes(&self, newer: &Program) -> Vec<FieldChange> {
        let mut out = Vec::new();
        push_change(&mut out, "name", &self.name, &newer.name);
        push_change(&mut out, "url", &self.url, &newer.url);
        push_change(
            &mut out,
            "offers_bounties",
            &self.offers_bounties.to_string(),
            &newer.offers_bounties.to_string(),
        );
        push_change(
            &mut out,
            "bounty_min",
            &display_amount(self.bounty_min),
            &display_amount(newer.bounty_min),
        );
        push_change(
            &mut out,
            "bounty_max",
            &display_amount(self.bounty_max),
            &display_amount(newer.bounty_max),
        );
        push_change(&mut out, "currency", &self.currency, &newer.currency);
        push_change(
            &mut out,
            "asset_types",
            &join_set(&self.asset_types),
            &join_set(&newer.asset_types),
        );
        if self.assets.iter().collect::<BTreeSet<_>>() != newer.assets.iter().collect::<BTreeSet<_>>() {
            out.push(FieldChange {
                field: "assets",
                before: format!("{} asset(s)", self.assets.len()),
                after: format!("{} asset(s)", newer.assets.len()),
            });
        }
        out
    }
}

fn push_change(out: &mut Vec<FieldChange>, field: &'static str, before: &str, after: &str) {
    if before != after {
        out.push(FieldChange {
            field,
            before: before.to_string(),
            after: after.to_string(),
        });
    }
}

fn display_amount(value: Option<i64>) -> String {
    value.map(format_usd).unwrap_or_else(|| "-".to_string())
}

fn join_set(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        return "-".to_string();
    }
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// `1234567` -> `"$1,234,567"`.
pub fn format_usd(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub before: String,
    pub after: String,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.before, self.after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeOutcome {
    Success,
    Partial,
    Failure,
}

impl ScrapeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for ScrapeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-invocation tallies. `created`, `updated` and `unchanged` count distinct
/// identities; repeat occurrences inside one batch land in `duplicates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrapeCounts {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Immutable audit record of one adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeLog {
    pub id: Option<i64>,
    pub platform: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ScrapeOutcome,
    pub counts: ScrapeCounts,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramChange {
    pub key: ProgramKey,
    pub kind: ChangeKind,
    pub before: Option<Program>,
    pub after: Program,
}

impl ProgramChange {
    pub fn field_changes(&self) -> Vec<FieldChange> {
        match &self.before {
            Some(before) => before.field_changes(&self.after),
            None => Vec::new(),
        }
    }
}

/// Ordered output of one reconciliation pass; consumed once by the notifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ProgramChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: ProgramChange) {
        self.entries.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProgramChange> {
        self.entries.iter()
    }

    pub fn created_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|c| c.kind == ChangeKind::Created)
            .count()
    }

    pub fn updated_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|c| c.kind == ChangeKind::Updated)
            .count()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ProgramChange;
    type IntoIter = std::slice::Iter<'a, ProgramChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
