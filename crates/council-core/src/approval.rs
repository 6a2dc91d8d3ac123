// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reviewer sign-off detection.
//!
//! A reviewer approves the current draft by including the literal token
//! `@@SIGNED OFF@@` in its critique.  A token immediately preceded by a
//! negation word (`NOT` with optional whitespace, `NO`/`NEVER` with at least
//! one whitespace) does not count.  The negation look-behinds deliberately
//! have no word boundary: "CANNOT @@SIGNED OFF@@" is treated as negated.

use fancy_regex::Regex;
use once_cell::sync::Lazy;

/// The literal token reviewers append to declare the draft publication-ready.
pub const APPROVAL_TOKEN: &str = "@@SIGNED OFF@@";

// Look-behind requires the backtracking engine; the token itself matches
// case-insensitively, as do the negation words.
static APPROVAL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(?<!not\s*)(?<!no\s+)(?<!never\s+)@@signed off@@").ok());

/// True iff `content` contains a non-negated occurrence of the sign-off
/// token.  Any regex-engine failure defaults to not-approved.
pub fn is_approved(content: &str) -> bool {
    match APPROVAL_RE.as_ref() {
        Some(re) => re.is_match(content).unwrap_or(false),
        None => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
