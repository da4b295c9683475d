// src/core/similarity.rs

//! Structural similarity between pages.
//!
//! A page's signature is the ordered list of opening tags in its source, each
//! followed by `#<id>` when the tag carries an `id` attribute. Two signatures are
//! compared with the matching-blocks ratio `2 * M / (len_a + len_b)`, where `M`
//! counts elements in the recursively found longest common blocks.

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{
    BufferQueue, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
};
use std::cell::RefCell;
use std::collections::HashMap;
use uuid::Uuid;

/// Minimum ratio a page needs against every member to join a cluster.
pub const CLUSTER_THRESHOLD: f64 = 0.80;

/// Sequences at least this long get their most common elements ignored when
/// searching for blocks, which keeps long documents tractable.
const AUTOJUNK_MIN_LEN: usize = 200;

/// Collects opening tags in source order. Nothing is inferred, so a fragment
/// without `<html>` or `<body>` gets neither.
#[derive(Default)]
struct StartTags {
    structure: RefCell<Vec<String>>,
}

impl TokenSink for StartTags {
    type Handle = ();

    fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        let Token::TagToken(tag) = token else {
            return TokenSinkResult::Continue;
        };
        if tag.kind != TagKind::StartTag || tag.self_closing {
            return TokenSinkResult::Continue;
        }

        let name: &str = &tag.name;
        let mut structure = self.structure.borrow_mut();
        structure.push(name.to_string());
        if let Some(id) = tag.attrs.iter().find(|attr| &*attr.name.local == "id") {
            structure.push(format!("#{}", id.value));
        }

        // Element content that is text, not markup.
        match name {
            "script" => TokenSinkResult::RawData(RawKind::ScriptData),
            "style" | "xmp" | "iframe" | "noembed" | "noframes" => TokenSinkResult::RawData(RawKind::Rawtext),
            "title" | "textarea" => TokenSinkResult::RawData(RawKind::Rcdata),
            "plaintext" => TokenSinkResult::Plaintext,
            _ => TokenSinkResult::Continue,
        }
    }
}

/// Extracts the structural signature of an HTML body: every opening tag in
/// source order, each followed by `#<id>` for its first `id` attribute.
/// Self-closing tags are not opening tags.
///
/// Empty bodies and bodies that are not valid UTF-8 yield an empty signature.
pub fn page_structure(body: &[u8]) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(body) else {
        return Vec::new();
    };
    if text.trim().is_empty() {
        return Vec::new();
    }

    let input = BufferQueue::default();
    input.push_back(StrTendril::from_slice(text));
    let tokenizer = Tokenizer::new(StartTags::default(), TokenizerOpts::default());
    let _ = tokenizer.feed(&input);
    tokenizer.end();
    tokenizer.sink.structure.take()
}

/// Longest-matching-blocks similarity of two token sequences, in `[0, 1]`.
pub fn similarity<S: AsRef<str>>(a: &[S], b: &[S]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let a: Vec<&str> = a.iter().map(AsRef::as_ref).collect();
    let b: Vec<&str> = b.iter().map(AsRef::as_ref).collect();
    let matches = SequenceMatcher::new(&a, &b).matching_elements();
    2.0 * matches as f64 / total as f64
}

struct SequenceMatcher<'a> {
    a: &'a [&'a str],
    b: &'a [&'a str],
    b2j: HashMap<&'a str, Vec<usize>>,
}

impl<'a> SequenceMatcher<'a> {
    fn new(a: &'a [&'a str], b: &'a [&'a str]) -> Self {
        let mut b2j: HashMap<&str, Vec<usize>> = HashMap::new();
        for (j, token) in b.iter().enumerate() {
            b2j.entry(*token).or_default().push(j);
        }
        if b.len() >= AUTOJUNK_MIN_LEN {
            let popular = b.len() / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= popular);
        }
        Self { a, b, b2j }
    }

    /// Longest block `(i, j, size)` with `a[i..i+size] == b[j..j+size]` in the given window.
    fn longest_match(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> (usize, usize, usize) {
        let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for i in alo..ahi {
            let mut next: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b2j.get(self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j.checked_sub(1).and_then(|p| j2len.get(&p)).copied().unwrap_or(0) + 1;
                    next.insert(j, k);
                    if k > best_size {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best_size = k;
                    }
                }
            }
            j2len = next;
        }

        // Grow the block over elements that were left out of the index as too common.
        while best_i > alo && best_j > blo && self.a[best_i - 1] == self.b[best_j - 1] {
            best_i -= 1;
            best_j -= 1;
            best_size += 1;
        }
        while best_i + best_size < ahi
            && best_j + best_size < bhi
            && self.a[best_i + best_size] == self.b[best_j + best_size]
        {
            best_size += 1;
        }
        (best_i, best_j, best_size)
    }

    fn matching_elements(&self) -> usize {
        let mut matched = 0;
        let mut queue = vec![(0, self.a.len(), 0, self.b.len())];
        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let (i, j, size) = self.longest_match(alo, ahi, blo, bhi);
            if size == 0 {
                continue;
            }
            matched += size;
            if alo < i && blo < j {
                queue.push((alo, i, blo, j));
            }
            if i + size < ahi && j + size < bhi {
                queue.push((i + size, ahi, j + size, bhi));
            }
        }
        matched
    }
}

/// A group of structurally similar pages, members in joining order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    pub members: Vec<String>,
}

/// Greedy single-pass clustering over `(url, signature)` pairs.
///
/// Pages are taken in the given order. Each joins the first existing cluster
/// (in creation order) whose every member it matches at or above
/// [`CLUSTER_THRESHOLD`]; otherwise it founds a new cluster. A page with an
/// empty signature always stays alone.
pub fn cluster_pages<S: AsRef<str>>(pages: &[(String, Vec<S>)]) -> Vec<Cluster> {
    let mut clusters: Vec<(Cluster, Vec<usize>)> = Vec::new();
    for (index, (url, signature)) in pages.iter().enumerate() {
        let home = clusters.iter_mut().find(|(_, members)| {
            !signature.is_empty()
                && members
                    .iter()
                    .all(|&m| similarity(signature, &pages[m].1) >= CLUSTER_THRESHOLD)
        });
        match home {
            Some((cluster, members)) => {
                cluster.members.push(url.clone());
                members.push(index);
            }
            None => clusters.push((
                Cluster {
                    id: Uuid::new_v4().to_string(),
                    members: vec![url.clone()],
                },
                vec![index],
            )),
        }
    }
    clusters.into_iter().map(|(cluster, _)| cluster).collect()
}
