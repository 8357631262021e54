//! Turning feed entries into chat messages.

use crate::feed::Item;
use crate::matrix::Message;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Entry has neither a title nor a link")]
    Empty,

    #[error("No <img> tag in entry description")]
    MissingImage,

    #[error("Malformed markup in entry description: {0}")]
    Markup(#[from] quick_xml::Error),
}

/// How entries of a feed are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatStyle {
    /// One text message: `"{title} - {link}"`.
    #[default]
    Text,
    /// Like `Text`, plus an HTML body where the title links to the entry.
    Html,
    /// Comic-style feeds whose description is an `<img>` tag: the title, the
    /// image itself, then the image's hover text.
    Image,
}

/// Renders one entry as the messages to post, in posting order.
pub fn format_entry(item: &Item, style: FormatStyle) -> Result<Vec<Message>, FormatError> {
    match style {
        FormatStyle::Text => format_text(item).map(|m| vec![m]),
        FormatStyle::Html => format_html(item).map(|m| vec![m]),
        FormatStyle::Image => format_image(item),
    }
}

fn format_text(item: &Item) -> Result<Message, FormatError> {
    let body = match (item.title.is_empty(), item.link.is_empty()) {
        (false, false) => format!("{} - {}", item.title, item.link),
        (false, true) => item.title.clone(),
        (true, false) => item.link.clone(),
        (true, true) => return Err(FormatError::Empty),
    };
    Ok(Message::text(body))
}

fn format_html(item: &Item) -> Result<Message, FormatError> {
    let plain = format_text(item)?;
    if item.title.is_empty() || item.link.is_empty() {
        return Ok(plain);
    }
    let formatted = format!(
        "<a href=\"{}\">{}</a>",
        escape(item.link.as_str()),
        escape(item.title.as_str())
    );
    Ok(Message::html(plain.body, formatted))
}

fn format_image(item: &Item) -> Result<Vec<Message>, FormatError> {
    let img = find_img(&item.description)?.ok_or(FormatError::MissingImage)?;

    let mut messages = vec![
        Message::text(item.title.clone()),
        Message::image(item.link.clone(), upgrade_to_https(&img.src)),
    ];
    if !img.title.is_empty() {
        messages.push(Message::text(img.title));
    }
    Ok(messages)
}

#[derive(Debug, Default)]
struct ImgTag {
    src: String,
    title: String,
}

/// First `<img>` element in `markup`, if any.
fn find_img(markup: &str) -> Result<Option<ImgTag>, FormatError> {
    let mut reader = Reader::from_str(markup);

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"img" => {
                return img_attributes(&e, &reader).map(Some);
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn img_attributes(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<ImgTag, FormatError> {
    let mut img = ImgTag::default();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"src" => img.src = attr.decode_and_unescape_value(decoder)?.into_owned(),
            b"title" => img.title = attr.decode_and_unescape_value(decoder)?.into_owned(),
            _ => {}
        }
    }
    Ok(img)
}

fn upgrade_to_https(src: &str) -> String {
    match src.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => src.to_string(),
    }
}
