//! Buckets a message stream into logical delivery groups.
//!
//! Groups are the atomic forwarding unit: multi-part archives either travel
//! together or not at all.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::types::message::Message;

/// How messages are bucketed before delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupingStrategy {
    /// Every message is its own group.
    None,
    /// New group when the sender changes or the gap exceeds the window.
    Time { window_seconds: i64 },
    /// Bucket by `(sender, base name, extension)` with part-number ordering.
    Filename,
}

impl GroupingStrategy {
    /// Resolve a configured strategy name. Unknown names degrade to `none`
    /// so a typo in the config never drops messages.
    pub fn resolve(name: &str, window_seconds: u64) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "time" => Self::Time {
                window_seconds: window_seconds as i64,
            },
            "filename" => Self::Filename,
            other => {
                warn!(strategy = other, "unknown grouping strategy, using 'none'");
                Self::None
            }
        }
    }
}

/// Result of part-token filename parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFilename {
    pub base: String,
    pub part_token: String,
    pub part_number: u32,
    pub extension: String,
}

const MULTI_DOT_EXTENSIONS: &[&str] = &[".tar.gz", ".tar.bz2", ".tar.xz"];

fn standalone_part_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        vec![
            Regex::new(r"(?i)^\.part(\d+)$").unwrap(),
            Regex::new(r"(?i)^_part(\d+)$").unwrap(),
            Regex::new(r"(?i)^\s*\((\d+)\)$").unwrap(),
        ]
    })
}

fn trailing_part_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        vec![
            Regex::new(r"(?i)(\.part(\d+))$").unwrap(),
            Regex::new(r"(?i)(_part(\d+))$").unwrap(),
            Regex::new(r"(?i)(\s*\((\d+)\))$").unwrap(),
            Regex::new(r"(?i)(\.(\d{1,4}))$").unwrap(),
            Regex::new(r"(?i)(_(\d{1,4}))$").unwrap(),
        ]
    })
}

/// Split a filename into `(base, part_token, part_number, extension)`.
///
/// Multi-dot archive extensions are kept whole; a part token sitting in the
/// extension position (`archive.part2`) is recognised as a part with an
/// empty extension; a filename that is nothing but a part token keeps itself
/// as the base with no part.
pub fn parse_filename(filename: &str) -> ParsedFilename {
    if filename.is_empty() {
        return ParsedFilename {
            base: String::new(),
            part_token: String::new(),
            part_number: 0,
            extension: String::new(),
        };
    }

    let mut name_sans_ext = filename.to_string();
    let mut extension = String::new();

    let lower = filename.to_ascii_lowercase();
    for multi_ext in MULTI_DOT_EXTENSIONS {
        if lower.ends_with(multi_ext) {
            name_sans_ext = filename[..filename.len() - multi_ext.len()].to_string();
            extension = (*multi_ext).to_string();
            break;
        }
    }

    if extension.is_empty() {
        if let Some(pos) = name_sans_ext.rfind('.') {
            extension = name_sans_ext[pos..].to_string();
            name_sans_ext.truncate(pos);
        }
    }

    // A part token occupying the extension slot ("archive.part2").
    if !extension.is_empty() {
        for pattern in standalone_part_regexes() {
            if let Some(caps) = pattern.captures(&extension) {
                if let Ok(part_number) = caps[1].parse::<u32>() {
                    return ParsedFilename {
                        base: name_sans_ext,
                        part_token: extension,
                        part_number,
                        extension: String::new(),
                    };
                }
            }
        }
    }

    for pattern in trailing_part_regexes() {
        let Some(caps) = pattern.captures(&name_sans_ext) else {
            continue;
        };
        let whole = caps.get(1).unwrap();
        let part_token = whole.as_str().to_string();
        let mut base = name_sans_ext[..whole.start()].to_string();

        if base.ends_with(' ') && !part_token.starts_with(' ') {
            base.truncate(base.trim_end_matches(' ').len());
        }

        // The filename is nothing but the part token ("_part1.ext").
        if base.is_empty() && part_token == name_sans_ext {
            return ParsedFilename {
                base: name_sans_ext,
                part_token: String::new(),
                part_number: 0,
                extension,
            };
        }

        let Ok(part_number) = caps[2].parse::<u32>() else {
            continue;
        };
        return ParsedFilename {
            base,
            part_token,
            part_number,
            extension,
        };
    }

    ParsedFilename {
        base: name_sans_ext,
        part_token: String::new(),
        part_number: 0,
        extension,
    }
}

pub struct MessageGrouper {
    strategy: GroupingStrategy,
}

impl MessageGrouper {
    pub fn new(strategy: GroupingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> GroupingStrategy {
        self.strategy
    }

    /// Group messages ordered ascending by id. The result is deterministic
    /// and ordered by the id of each group's first member.
    pub fn group(&self, messages: Vec<Message>) -> Vec<Vec<Message>> {
        if messages.is_empty() {
            return Vec::new();
        }
        match self.strategy {
            GroupingStrategy::None => messages.into_iter().map(|m| vec![m]).collect(),
            GroupingStrategy::Time { window_seconds } => {
                Self::group_by_time(messages, window_seconds)
            }
            GroupingStrategy::Filename => Self::group_by_filename(messages),
        }
    }

    fn group_by_time(messages: Vec<Message>, window_seconds: i64) -> Vec<Vec<Message>> {
        let mut groups: Vec<Vec<Message>> = Vec::new();
        let mut current: Vec<Message> = Vec::new();

        for message in messages {
            match current.last() {
                Some(prev) => {
                    let gap = (message.date - prev.date).num_seconds();
                    let same_sender = message.sender_id == prev.sender_id;
                    if same_sender && gap <= window_seconds {
                        current.push(message);
                    } else {
                        groups.push(std::mem::take(&mut current));
                        current.push(message);
                    }
                }
                None => current.push(message),
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    fn group_by_filename(messages: Vec<Message>) -> Vec<Vec<Message>> {
        type BucketKey = (i64, String, String);
        let mut buckets: HashMap<BucketKey, Vec<Message>> = HashMap::new();
        let mut bucket_order: Vec<BucketKey> = Vec::new();
        let mut loners: Vec<Message> = Vec::new();

        for message in messages {
            let Some(sender_id) = message.sender_id else {
                loners.push(message);
                continue;
            };
            let Some(filename) = message.file_name().map(str::to_string) else {
                loners.push(message);
                continue;
            };
            let parsed = parse_filename(&filename);
            if parsed.base.is_empty() {
                loners.push(message);
                continue;
            }

            let key = (
                sender_id,
                parsed.base.to_ascii_lowercase(),
                parsed.extension.to_ascii_lowercase(),
            );
            if !buckets.contains_key(&key) {
                bucket_order.push(key.clone());
            }
            buckets.entry(key).or_default().push(message);
        }

        let mut groups: Vec<Vec<Message>> = Vec::new();
        for key in bucket_order {
            let mut members = buckets.remove(&key).unwrap_or_default();
            if members.len() > 1 {
                members.sort_by_key(|m| {
                    let part = m
                        .file_name()
                        .map(|name| parse_filename(name).part_number)
                        .unwrap_or(0);
                    (part, m.id)
                });
                groups.push(members);
            } else {
                loners.append(&mut members);
            }
        }

        for loner in loners {
            groups.push(vec![loner]);
        }

        groups.sort_by_key(|g| g.first().map(|m| m.id).unwrap_or(i64::MAX));
        groups
    }
}
