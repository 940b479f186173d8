mod entry;
mod group;
mod meta;

use std::{collections::HashMap, iter::Peekable};

use base64::{engine::general_purpose as base64_engine, Engine as _};
use chrono::NaiveDateTime;
use uuid::Uuid;
use xml::{name::OwnedName, reader::XmlEvent, EventReader};

use crate::{
    crypt::ciphers::Cipher,
    db::{Color, CustomData, CustomDataItem, DeletedObject, DeletedObjects, Group, Meta, Times, Value},
    error::XmlParseError,
    xml_db::get_epoch_baseline,
};

/// Parse a KDBX timestamp: the ISO 8601 string form used by KDBX3 or the
/// Base64 little-endian tick count used by KDBX4.
pub fn parse_xml_timestamp(t: &str) -> Result<NaiveDateTime, XmlParseError> {
    match NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%SZ") {
        Ok(ndt) => Ok(ndt),
        _ => match NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S") {
            Ok(ndt) => Ok(ndt),
            _ => {
                let v = base64_engine::STANDARD.decode(t)?;

                let mut a: [u8; 8] = [0; 8];
                let len = v.len().min(8);
                a[..len].copy_from_slice(&v[..len]);
                let seconds = i64::from_le_bytes(a);

                // values outside the representable range are pinned to the
                // range ends; the loader reports them on the warning channel
                let ndt = get_epoch_baseline()
                    .checked_add_signed(chrono::Duration::seconds(seconds))
                    .unwrap_or(if seconds < 0 {
                        NaiveDateTime::MIN
                    } else {
                        NaiveDateTime::MAX
                    });
                Ok(ndt)
            }
        },
    }
}

/// Trait that denotes that a KDBX object can be parsed from a stream of
/// `SimpleXmlEvent`.
///
/// The parser implementation should consume everything from the start tag of
/// an object to the end tag, both inclusive, and use the `Peekable::peek`
/// method to decide when to call into sub-parsers.
pub(crate) trait FromXml {
    type Parses;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError>;
}

/// Helper type to flatten out the Result<XmlEvent> types returned by the
/// EventReader, since many of the parsers need to do a lot of destructuring
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum SimpleXmlEvent {
    Start(String, HashMap<String, String>),
    End(String),
    Characters(String),
    Err(xml::reader::Error),
}

pub(crate) fn parse(xml: &[u8], inner_cipher: &mut dyn Cipher) -> Result<KeePassXml, XmlParseError> {
    parse_from_bytes::<KeePassXml>(xml, inner_cipher)
}

pub(crate) fn parse_from_bytes<P: FromXml>(
    xml: &[u8],
    inner_cipher: &mut dyn Cipher,
) -> Result<<P as FromXml>::Parses, XmlParseError> {
    let mut reader = EventReader::new(xml)
        .into_iter()
        .filter_map(|e| {
            // simplify the event stream by ignoring unneeded events and
            // flattening the structure
            match e {
                Ok(XmlEvent::StartElement {
                    name: OwnedName { local_name, .. },
                    attributes,
                    ..
                }) => Some(SimpleXmlEvent::Start(
                    local_name,
                    attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect(),
                )),
                Ok(XmlEvent::EndElement {
                    name: OwnedName { local_name, .. },
                }) => Some(SimpleXmlEvent::End(local_name)),
                Ok(XmlEvent::Characters(c)) => Some(SimpleXmlEvent::Characters(c)),
                Err(e) => Some(SimpleXmlEvent::Err(e)),

                // ignore whitespace, comments, ...
                _ => None,
            }
        })
        .peekable();

    P::from_xml(&mut reader, inner_cipher)
}

/// Helper trait for converting `SimpleXmlEvent::Characters` into types that
/// can be parsed from strings.
///
/// Note that we cannot use FromStr here since we need to be able to
/// customize the code for some of the types to account for how they are
/// represented in the XML documents (e.g. bool, NaiveDateTime, Uuid)
trait FromXmlCharacters: Sized {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError>;
}

impl<T: FromXmlCharacters> FromXml for T {
    type Parses = T;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        _inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let event = iterator.next().ok_or(XmlParseError::Eof)?;
        if let SimpleXmlEvent::Characters(text) = event {
            T::from_xml_characters(&text)
        } else {
            Err(XmlParseError::BadEvent {
                expected: "text containing a value",
                event,
            })
        }
    }
}

impl<T: FromXmlCharacters> FromXml for Option<T> {
    type Parses = Option<T>;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        _inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let event = iterator.peek().ok_or(XmlParseError::Eof)?;
        if let SimpleXmlEvent::Characters(_) = event {
            // now that we know that characters are upcoming, proceed the iterator.
            if let SimpleXmlEvent::Characters(text) = iterator.next().ok_or(XmlParseError::Eof)? {
                return Ok(Some(T::from_xml_characters(&text)?));
            }
        }
        Ok(None)
    }
}

impl FromXmlCharacters for usize {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        Ok(s.parse()?)
    }
}

impl FromXmlCharacters for isize {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        Ok(s.parse()?)
    }
}

impl FromXmlCharacters for bool {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        Ok(s.to_lowercase().parse()?)
    }
}

impl FromXmlCharacters for String {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        Ok(s.to_string())
    }
}

impl FromXmlCharacters for NaiveDateTime {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        parse_xml_timestamp(s)
    }
}

impl FromXmlCharacters for Uuid {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        let decoded = base64_engine::STANDARD.decode(s)?;
        Ok(Uuid::from_slice(&decoded)?)
    }
}

impl FromXmlCharacters for Color {
    fn from_xml_characters(s: &str) -> Result<Self, XmlParseError> {
        Ok(s.parse()?)
    }
}

/// Tri-state flags are serialized as `null` when inherited from the parent
pub(crate) fn parse_tristate(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Helper type to denote a tag with a character content that can be parsed.
#[derive(Debug)]
pub(crate) struct SimpleTag<V> {
    pub(crate) name: String,
    pub(crate) value: V,
}

impl<V: FromXml> FromXml for SimpleTag<V> {
    type Parses = SimpleTag<<V as FromXml>::Parses>;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if let SimpleXmlEvent::Start(name, _) = open_tag {
            let value = V::from_xml(iterator, inner_cipher)?;

            let close_tag = iterator.next().ok_or(XmlParseError::Eof)?;
            if !matches!(close_tag, SimpleXmlEvent::End(ref tag) if tag == &name) {
                return Err(XmlParseError::BadEvent {
                    expected: "Close tag",
                    event: close_tag,
                });
            }

            Ok(SimpleTag { name, value })
        } else {
            Err(XmlParseError::BadEvent {
                expected: "Open tag",
                event: open_tag,
            })
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct KeePassXml {
    pub(crate) meta: Meta,
    pub(crate) root: Root,
}

impl FromXml for KeePassXml {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "KeePassFile") {
            return Err(XmlParseError::BadEvent {
                expected: "Open KeePassFile tag",
                event: open_tag,
            });
        }

        let mut out = Self::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "Meta" => {
                        out.meta = Meta::from_xml(iterator, inner_cipher)?;
                    }
                    "Root" => {
                        out.root = Root::from_xml(iterator, inner_cipher)?;
                    }
                    _ => {
                        return Err(XmlParseError::BadEvent {
                            expected: "valid KeePassFile child",
                            event: event.clone(),
                        })
                    }
                },
                SimpleXmlEvent::End(name) if name == "KeePassFile" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close KeePassFile",
                        event: event.clone(),
                    })
                }
            }
        }

        // no need to check for the correct closing tag - checked by XmlReader
        let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

        Ok(out)
    }
}

impl FromXml for Times {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "Times") {
            return Err(XmlParseError::BadEvent {
                expected: "Open Times tag",
                event: open_tag,
            });
        }

        let mut out = Times::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "Expires" => {
                        out.expires = SimpleTag::<bool>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "UsageCount" => {
                        out.usage_count = SimpleTag::<usize>::from_xml(iterator, inner_cipher)?.value;
                    }

                    _ => {
                        let time = SimpleTag::<NaiveDateTime>::from_xml(iterator, inner_cipher)?;
                        out.times.insert(time.name, time.value);
                    }
                },
                SimpleXmlEvent::End(name) if name == "Times" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close Times",
                        event: event.clone(),
                    })
                }
            }
        }

        // no need to check for the correct closing tag - checked by XmlReader
        let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

        Ok(out)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Root {
    pub(crate) group: Group,
    pub(crate) deleted_objects: DeletedObjects,
}

impl FromXml for Root {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "Root") {
            return Err(XmlParseError::BadEvent {
                expected: "Open Root tag",
                event: open_tag,
            });
        }

        let mut out = Self::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "Group" => {
                        out.group = Group::from_xml(iterator, inner_cipher)?;
                    }
                    "DeletedObjects" => {
                        out.deleted_objects = DeletedObjects::from_xml(iterator, inner_cipher)?;
                    }
                    _ => {
                        return Err(XmlParseError::BadEvent {
                            expected: "valid Root child",
                            event: event.clone(),
                        })
                    }
                },
                SimpleXmlEvent::End(name) if name == "Root" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close Root",
                        event: event.clone(),
                    })
                }
            }
        }

        // no need to check for the correct closing tag - checked by XmlReader
        let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

        Ok(out)
    }
}

impl FromXml for DeletedObjects {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "DeletedObjects") {
            return Err(XmlParseError::BadEvent {
                expected: "Open DeletedObjects tag",
                event: open_tag,
            });
        }

        let mut out = Self::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "DeletedObject" => {
                        let object = DeletedObject::from_xml(iterator, inner_cipher)?;
                        out.objects.push(object);
                    }
                    _ => {
                        return Err(XmlParseError::BadEvent {
                            expected: "valid DeletedObjects child",
                            event: event.clone(),
                        })
                    }
                },
                SimpleXmlEvent::End(name) if name == "DeletedObjects" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close DeletedObjects",
                        event: event.clone(),
                    })
                }
            }
        }

        // no need to check for the correct closing tag - checked by XmlReader
        let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

        Ok(out)
    }
}

impl FromXml for DeletedObject {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "DeletedObject") {
            return Err(XmlParseError::BadEvent {
                expected: "Open DeletedObject tag",
                event: open_tag,
            });
        }

        let mut out = Self::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "UUID" => {
                        out.uuid = SimpleTag::<Uuid>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "DeletionTime" => {
                        out.deletion_time =
                            SimpleTag::<NaiveDateTime>::from_xml(iterator, inner_cipher)?.value;
                    }
                    _ => {
                        return Err(XmlParseError::BadEvent {
                            expected: "valid DeletedObject child",
                            event: event.clone(),
                        })
                    }
                },
                SimpleXmlEvent::End(name) if name == "DeletedObject" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close DeletedObject",
                        event: event.clone(),
                    })
                }
            }
        }

        // no need to check for the correct closing tag - checked by XmlReader
        let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

        Ok(out)
    }
}

impl FromXml for CustomData {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "CustomData") {
            return Err(XmlParseError::BadEvent {
                expected: "Open CustomData tag",
                event: open_tag,
            });
        }

        let mut out = Self::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "Item" => {
                        let (key, item) = parse_custom_data_item(iterator, inner_cipher)?;
                        out.items.insert(key, item);
                    }
                    _ => {
                        return Err(XmlParseError::BadEvent {
                            expected: "valid CustomData child",
                            event: event.clone(),
                        })
                    }
                },
                SimpleXmlEvent::End(name) if name == "CustomData" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close CustomData",
                        event: event.clone(),
                    })
                }
            }
        }

        // no need to check for the correct closing tag - checked by XmlReader
        let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

        Ok(out)
    }
}

fn parse_custom_data_item<I: Iterator<Item = SimpleXmlEvent>>(
    iterator: &mut Peekable<I>,
    inner_cipher: &mut dyn Cipher,
) -> Result<(String, CustomDataItem), XmlParseError> {
    let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
    if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "Item") {
        return Err(XmlParseError::BadEvent {
            expected: "Open Item tag",
            event: open_tag,
        });
    }

    let mut key = String::new();
    let mut item = CustomDataItem::default();

    while let Some(event) = iterator.peek() {
        match event {
            SimpleXmlEvent::Start(name, _) => match &name[..] {
                "Key" => {
                    key = SimpleTag::<String>::from_xml(iterator, inner_cipher)?.value;
                }
                "Value" => {
                    item.value = Some(Value::from_xml(iterator, inner_cipher)?);
                }
                "LastModificationTime" => {
                    item.last_modification_time =
                        SimpleTag::<Option<NaiveDateTime>>::from_xml(iterator, inner_cipher)?.value;
                }
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "valid Item child",
                        event: event.clone(),
                    })
                }
            },
            SimpleXmlEvent::End(name) if name == "Item" => break,
            _ => {
                return Err(XmlParseError::BadEvent {
                    expected: "start tag or close Item",
                    event: event.clone(),
                })
            }
        }
    }

    // no need to check for the correct closing tag - checked by XmlReader
    let _close_tag = iterator.next().ok_or(XmlParseError::Eof)?;

    Ok((key, item))
}

/// A helper parser that will ignore everything in its tag.
pub(crate) struct IgnoreSubfield;

impl FromXml for IgnoreSubfield {
    type Parses = ();

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        _inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if let SimpleXmlEvent::Start(_, _) = open_tag {
            let mut stack = Vec::new();

            for event in iterator.by_ref() {
                match event {
                    SimpleXmlEvent::Start(t, _) => stack.push(t),
                    SimpleXmlEvent::End(_) => {
                        // ascend the stack of inner elements. matching closing tag is ensured
                        // by XmlReader
                        if stack.pop().is_none() {
                            // we are back at the root of the subparser
                            break;
                        }
                    }
                    SimpleXmlEvent::Characters(_) => {}
                    SimpleXmlEvent::Err(e) => return Err(e.into()),
                }
            }
        } else {
            return Err(XmlParseError::BadEvent {
                expected: "Open tag (to be ignored)",
                event: open_tag,
            });
        }

        Ok(())
    }
}
