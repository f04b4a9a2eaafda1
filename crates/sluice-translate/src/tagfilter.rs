// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Incremental container-tag filter.
//!
//! The upstream interleaves renderable markers (`<xaiartifact>…</xaiartifact>`,
//! `<grok:render>…</grok:render>`) into assistant text.  Clients speaking the
//! OpenAI protocol must never see them, so text between an opening tag and
//! its matching close is suppressed — case-insensitively, with a per-tag
//! depth counter for nesting.
//!
//! The filter is safe across arbitrary chunk boundaries: a tag split over
//! two deltas is buffered until it can be classified.  Suppressed text is
//! *held*, not dropped, so a stream that ends inside an unterminated tag
//! flushes the held region back out as plain text.

use std::collections::HashMap;

pub struct TagFilter {
    /// Filtered tag names, lowercase.
    tags: Vec<String>,
    /// Open-tag depth per name.
    depth: HashMap<String, u32>,
    total_depth: u32,
    /// Partial `<...` candidate not yet classified.
    pending: String,
    /// Suppressed region, kept for the unterminated-tag flush.
    held: String,
}

impl TagFilter {
    pub fn new(tags: &[String]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_ascii_lowercase()).collect(),
            depth: HashMap::new(),
            total_depth: 0,
            pending: String::new(),
            held: String::new(),
        }
    }

    /// Feed a text delta; returns the text that is visible to the client.
    pub fn push(&mut self, input: &str) -> String {
        let mut out = String::new();
        for ch in input.chars() {
            if self.pending.is_empty() {
                if ch == '<' {
                    self.pending.push(ch);
                } else {
                    self.emit_char(ch, &mut out);
                }
            } else {
                self.pending.push(ch);
                self.scan_pending(&mut out);
            }
        }
        out
    }

    /// End-of-stream: any held suppressed region (unterminated tag) and any
    /// unclassified partial tag come back as plain text.
    pub fn flush(&mut self) -> String {
        let mut out = String::new();
        if self.total_depth > 0 {
            out.push_str(&self.held);
            self.depth.clear();
            self.total_depth = 0;
        }
        self.held.clear();
        out.push_str(&self.pending);
        self.pending.clear();
        out
    }

    fn emit_char(&mut self, ch: char, out: &mut String) {
        if self.total_depth > 0 {
            self.held.push(ch);
        } else {
            out.push(ch);
        }
    }

    /// Classify the pending buffer as early as possible: release it as
    /// plain text the moment it can no longer be a filtered tag, consume
    /// it once a complete filtered tag is buffered, keep buffering while
    /// the name is still an ambiguous prefix.
    fn scan_pending(&mut self, out: &mut String) {
        let inner = &self.pending[1..];
        let (is_close, name_part) = match inner.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        if name_part.is_empty() {
            return; // just "<" or "</" so far
        }

        let name_end = name_part.find(|c: char| c.is_whitespace() || c == '>');
        let (name, name_complete) = match name_end {
            Some(i) => (&name_part[..i], true),
            None => (name_part, false),
        };
        let lname = name.to_ascii_lowercase();

        if !name_complete {
            if !self.tags.iter().any(|t| t.starts_with(&lname)) {
                self.release_pending(out);
            }
            return;
        }

        if !self.tags.contains(&lname) {
            self.release_pending(out);
            return;
        }

        // A filtered tag: wait for the closing '>' of the tag itself
        // (attributes may be long), then apply it.
        if self.pending.ends_with('>') {
            let tag_text = std::mem::take(&mut self.pending);
            self.apply_tag(&lname, is_close, &tag_text, out);
        }
    }

    fn apply_tag(&mut self, name: &str, is_close: bool, tag_text: &str, out: &mut String) {
        if is_close {
            let depth = self.depth.entry(name.to_string()).or_insert(0);
            if *depth == 0 {
                // Stray close tag: pass through untouched.
                for ch in tag_text.chars() {
                    self.emit_char(ch, out);
                }
                return;
            }
            *depth -= 1;
            self.total_depth -= 1;
            if self.total_depth == 0 {
                self.held.clear();
            } else {
                self.held.push_str(tag_text);
            }
        } else {
            // Opening tag text goes into the held region so an unterminated
            // stream can be flushed losslessly.
            self.held.push_str(tag_text);
            *self.depth.entry(name.to_string()).or_insert(0) += 1;
            self.total_depth += 1;
        }
    }

    /// The pending buffer turned out not to be a filtered tag.  Its first
    /// `<` is plain text; the rest is re-fed since it may itself start a
    /// new candidate.
    fn release_pending(&mut self, out: &mut String) {
        let pending = std::mem::take(&mut self.pending);
        let mut chars = pending.chars();
        if let Some(first) = chars.next() {
            self.emit_char(first, out);
        }
        let rest: String = chars.collect();
        if !rest.is_empty() {
            let emitted = self.push(&rest);
            out.push_str(&emitted);
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
