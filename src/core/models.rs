// src/core/models.rs

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use uuid::Uuid;

// --- Header Classification ---

/// How a response header affects the security posture of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRule {
    /// Always leaks information or weakens the page.
    Decreases,
    /// Always a hardening header.
    Increases,
    /// Weakens the page only when the value equals this string.
    DecreasesWhenEquals(&'static str),
    /// Hardens when the value equals this string (case-insensitive).
    IncreasesWhenEquals(&'static str),
    /// Hardens when the value starts with this prefix, weakens otherwise.
    IncreasesWhenPrefixed(&'static str),
}

/// Classification rules keyed by lower-cased header name.
static HEADER_RULES: &[(&str, HeaderRule)] = &[
    ("server", HeaderRule::Decreases),
    ("wpe-backend", HeaderRule::Decreases),
    ("x-powered-by", HeaderRule::Decreases),
    ("x-cf-powered-by", HeaderRule::Decreases),
    ("x-pingback", HeaderRule::Decreases),
    ("access-control-allow-origin", HeaderRule::DecreasesWhenEquals("*")),
    ("x-xss-protection", HeaderRule::IncreasesWhenPrefixed("1")),
    ("content-security-policy", HeaderRule::Increases),
    ("content-security-policy-report-only", HeaderRule::Increases),
    ("strict-transport-security", HeaderRule::Increases),
    ("x-frame-options", HeaderRule::Increases),
    ("referrer-policy", HeaderRule::Increases),
    ("public-key-pins", HeaderRule::Increases),
    ("x-permitted-cross-domain-policies", HeaderRule::IncreasesWhenEquals("master-only")),
    ("x-content-type-options", HeaderRule::IncreasesWhenEquals("nosniff")),
];

/// Returns `(decreases_security, increases_security)` for a header.
pub fn classify_header(name: &str, value: &str) -> (bool, bool) {
    let name = name.to_ascii_lowercase();
    let Some((_, rule)) = HEADER_RULES.iter().find(|(n, _)| *n == name) else {
        return (false, false);
    };
    match *rule {
        HeaderRule::Decreases => (true, false),
        HeaderRule::Increases => (false, true),
        HeaderRule::DecreasesWhenEquals(v) => (value == v, false),
        HeaderRule::IncreasesWhenEquals(v) => (false, value.eq_ignore_ascii_case(v)),
        HeaderRule::IncreasesWhenPrefixed(p) => {
            let hardened = value.starts_with(p);
            (!hardened, hardened)
        }
    }
}

// --- Page Collections ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    pub value: String,
    pub decreases_security: bool,
    pub increases_security: bool,
}

impl Header {
    pub fn new(name: &str, value: &str) -> Self {
        let (decreases_security, increases_security) = classify_header(name, value);
        Self {
            name: name.to_string(),
            value: value.to_string(),
            decreases_security,
            increases_security,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub text: String,
    #[serde(rename = "type")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub hash: String,
}

impl Tag {
    pub fn new(text: &str, category: &str, link: Option<&str>) -> Self {
        // Each field is length-prefixed and a missing link hashes apart from an empty one.
        let mut hasher = Sha1::new();
        for field in [Some(text), Some(category), link] {
            match field {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        Self {
            text: text.to_string(),
            category: category.to_string(),
            link: link.map(str::to_string),
            hash: hex::encode(hasher.finalize()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    #[serde(rename = "type")]
    pub category: String,
}

// --- Page ---

/// Everything known about one URL. This is also the persisted shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageRecord {
    pub uuid: String,
    pub url: String,
    pub hostname: String,
    pub addrs: Vec<String>,
    pub status: String,
    pub page_title: String,
    #[serde(skip)]
    pub page_structure: Vec<String>,
    pub headers_path: String,
    pub body_path: String,
    pub screenshot_path: String,
    pub has_screenshot: bool,
    #[serde(rename = "differentFromLastTime")]
    pub different: bool,
    pub screenshot_difference: u32,
    pub headers: Vec<Header>,
    pub tags: Vec<Tag>,
    pub notes: Vec<Note>,
}

impl PageRecord {
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push(Header::new(name, value));
    }

    /// Adds a tag unless one with the same text, category and link exists.
    /// Returns whether the tag was stored.
    pub fn add_tag(&mut self, text: &str, category: &str, link: Option<&str>) -> bool {
        if self
            .tags
            .iter()
            .any(|t| t.text == text && t.category == category && t.link.as_deref() == link)
        {
            return false;
        }
        self.tags.push(Tag::new(text, category, link));
        true
    }

    pub fn add_note(&mut self, text: &str, category: &str) {
        self.notes.push(Note {
            text: text.to_string(),
            category: category.to_string(),
        });
    }
}

/// A registry entry. Identity fields are immutable; everything the agents
/// fill in sits behind a per-page lock.
#[derive(Debug)]
pub struct Page {
    id: String,
    url: String,
    hostname: String,
    record: Mutex<PageRecord>,
}

impl Page {
    pub fn new(page_url: &str) -> Result<Self, url::ParseError> {
        let parsed = url::Url::parse(page_url)?;
        let hostname = parsed
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        Ok(Self::from_record(PageRecord {
            uuid: Uuid::new_v4().to_string(),
            url: page_url.to_string(),
            hostname,
            ..Default::default()
        }))
    }

    pub fn from_record(record: PageRecord) -> Self {
        Self {
            id: record.uuid.clone(),
            url: record.url.clone(),
            hostname: record.hostname.clone(),
            record: Mutex::new(record),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether the host part of the URL is a literal IP address.
    pub fn is_ip_host(&self) -> bool {
        self.hostname.parse::<IpAddr>().is_ok()
    }

    /// Exclusive access to the mutable part of the page.
    pub fn lock(&self) -> MutexGuard<'_, PageRecord> {
        self.record.lock()
    }

    pub fn snapshot(&self) -> PageRecord {
        self.record.lock().clone()
    }

    pub fn add_tag(&self, text: &str, category: &str, link: Option<&str>) -> bool {
        self.lock().add_tag(text, category, link)
    }

    pub fn add_note(&self, text: &str, category: &str) {
        self.lock().add_note(text, category);
    }
}

impl Serialize for Page {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.lock().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Page {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        PageRecord::deserialize(deserializer).map(Page::from_record)
    }
}
