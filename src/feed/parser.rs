use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced while turning a fetched document into a [`Rss`] value.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not well-formed XML.
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// The document ended while elements were still open.
    #[error("Document ended inside <{0}>")]
    Truncated(String),

    /// Not RSS, and `feed-rs` could not make sense of it either.
    #[error("Unrecognized feed format: {0}")]
    Unsupported(#[from] feed_rs::parser::ParseFeedError),
}

/// A parsed feed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rss {
    pub channel: Channel,
}

/// Feed-level summary plus the entries in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    pub description: String,
    pub title: String,
    pub items: Vec<Item>,
}

/// One feed entry. Every field is whitespace-trimmed; absent fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub title: String,
    pub description: String,
    pub link: String,
    pub guid: String,
    pub pub_date: String,
}

impl Item {
    /// Identifier used to decide whether this entry was already forwarded.
    ///
    /// The guid when present, otherwise the link, otherwise a digest of the
    /// link, title and publish date so entries without identifiers don't all
    /// collapse onto the empty string.
    pub fn dedup_key(&self) -> String {
        if !self.guid.is_empty() {
            return self.guid.clone();
        }
        if !self.link.is_empty() {
            return self.link.clone();
        }

        let input = format!("{}|{}|{}", self.link, self.title, self.pub_date);
        let hash = Sha256::digest(input.as_bytes());
        format!("{:x}", hash)
    }
}

/// RSS fields we pick up while walking the element tree.
#[derive(Clone, Copy)]
enum Field {
    ChannelTitle,
    ChannelDescription,
    ItemTitle,
    ItemDescription,
    ItemLink,
    ItemGuid,
    ItemPubDate,
}

/// Parses a syndication feed.
///
/// RSS 2.0 documents are read directly: only the direct `<title>`,
/// `<description>` and `<item>` children of `<channel>` and the well-known
/// children of each `<item>` are kept, everything else (extension namespaces,
/// `<generator>`, attributes) is ignored. Documents whose root element is not
/// `<rss>`, including anything that is not markup at all, are handed to
/// `feed-rs`, which covers Atom and JSON Feed.
///
/// # Errors
///
/// - [`ParseError::Xml`] for markup that is not well-formed
/// - [`ParseError::Truncated`] when the document stops with open elements
/// - [`ParseError::Unsupported`] for anything `feed-rs` rejects
pub fn parse(bytes: &[u8]) -> Result<Rss, ParseError> {
    if starts_with_markup(bytes) && root_element(bytes).is_some_and(|root| root == b"rss") {
        parse_rss(bytes)
    } else {
        parse_with_feed_rs(bytes)
    }
}

/// True when the first non-whitespace byte after an optional UTF-8 BOM is `<`.
fn starts_with_markup(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'<')
}

/// Name of the first element in the document. `None` when there is no
/// element or the markup breaks before one is found.
fn root_element(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(e) | Event::Empty(e) => return Some(e.name().as_ref().to_vec()),
            Event::Eof => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn parse_rss(bytes: &[u8]) -> Result<Rss, ParseError> {
    // SEC-002: quick-xml (0.37) never expands <!ENTITY> declarations; only the
    // five XML builtins are resolved by `unescape()`.
    let mut reader = Reader::from_reader(bytes);

    let mut channel = Channel::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                stack.push(e.name().as_ref().to_vec());
                if is_item_path(&stack) {
                    channel.items.push(Item::default());
                }
            }
            Event::Empty(e) => {
                stack.push(e.name().as_ref().to_vec());
                if is_item_path(&stack) {
                    channel.items.push(Item::default());
                }
                stack.pop();
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(e) => {
                if let Some(field) = field_for(&stack) {
                    let text = e.unescape().map_err(quick_xml::Error::from)?;
                    append(&mut channel, field, &text);
                }
            }
            Event::CData(e) => {
                if let Some(field) = field_for(&stack) {
                    let text = reader.decoder().decode(&e).map_err(quick_xml::Error::from)?;
                    append(&mut channel, field, &text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Truncated(
            String::from_utf8_lossy(open).into_owned(),
        ));
    }

    trim_channel(&mut channel);
    Ok(Rss { channel })
}

fn is_item_path(stack: &[Vec<u8>]) -> bool {
    stack.len() == 3 && stack[1] == b"channel" && stack[2] == b"item"
}

fn field_for(stack: &[Vec<u8>]) -> Option<Field> {
    match stack {
        [_, channel, name] if channel == b"channel" => match name.as_slice() {
            b"title" => Some(Field::ChannelTitle),
            b"description" => Some(Field::ChannelDescription),
            _ => None,
        },
        [_, channel, item, name] if channel == b"channel" && item == b"item" => {
            match name.as_slice() {
                b"title" => Some(Field::ItemTitle),
                b"description" => Some(Field::ItemDescription),
                b"link" => Some(Field::ItemLink),
                b"guid" => Some(Field::ItemGuid),
                b"pubDate" => Some(Field::ItemPubDate),
                _ => None,
            }
        }
        _ => None,
    }
}

fn append(channel: &mut Channel, field: Field, text: &str) {
    let target = match field {
        Field::ChannelTitle => &mut channel.title,
        Field::ChannelDescription => &mut channel.description,
        item_field => {
            // Item fields only match while an <item> is open, so one exists.
            let Some(item) = channel.items.last_mut() else {
                return;
            };
            match item_field {
                Field::ItemTitle => &mut item.title,
                Field::ItemDescription => &mut item.description,
                Field::ItemLink => &mut item.link,
                Field::ItemGuid => &mut item.guid,
                Field::ItemPubDate => &mut item.pub_date,
                Field::ChannelTitle | Field::ChannelDescription => return,
            }
        }
    };
    target.push_str(text);
}

fn trim_channel(channel: &mut Channel) {
    trim_in_place(&mut channel.title);
    trim_in_place(&mut channel.description);
    for item in &mut channel.items {
        trim_in_place(&mut item.title);
        trim_in_place(&mut item.description);
        trim_in_place(&mut item.link);
        trim_in_place(&mut item.guid);
        trim_in_place(&mut item.pub_date);
    }
}

fn trim_in_place(s: &mut String) {
    let trimmed = s.trim();
    if trimmed.len() != s.len() {
        *s = trimmed.to_string();
    }
}

fn parse_with_feed_rs(bytes: &[u8]) -> Result<Rss, ParseError> {
    let feed = feed_rs::parser::parse(bytes)?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
            let pub_date = entry
                .published
                .or(entry.updated)
                .map(|dt| dt.to_rfc2822())
                .unwrap_or_default();
            let description = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let title = entry.title.map(|t| t.content).unwrap_or_default();

            Item {
                title,
                description,
                link,
                guid: entry.id,
                pub_date,
            }
        })
        .collect();

    let mut channel = Channel {
        description: feed.description.map(|d| d.content).unwrap_or_default(),
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        items,
    };
    trim_channel(&mut channel);

    Ok(Rss { channel })
}
