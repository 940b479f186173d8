use std::iter::Peekable;

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::{
    crypt::ciphers::Cipher,
    db::{CustomData, Entry, Group, Times},
    error::XmlParseError,
    xml_db::parse::{parse_tristate, FromXml, IgnoreSubfield, SimpleTag, SimpleXmlEvent},
};

impl FromXml for Group {
    type Parses = Self;

    fn from_xml<I: Iterator<Item = SimpleXmlEvent>>(
        iterator: &mut Peekable<I>,
        inner_cipher: &mut dyn Cipher,
    ) -> Result<Self::Parses, XmlParseError> {
        let open_tag = iterator.next().ok_or(XmlParseError::Eof)?;
        if !matches!(open_tag, SimpleXmlEvent::Start(ref tag, _) if tag == "Group") {
            return Err(XmlParseError::BadEvent {
                expected: "Open Group tag",
                event: open_tag,
            });
        }

        let mut out = Group::default();

        while let Some(event) = iterator.peek() {
            match event {
                SimpleXmlEvent::Start(name, _) => match &name[..] {
                    "UUID" => {
                        out.uuid = SimpleTag::<Uuid>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "Name" => {
                        out.name = SimpleTag::<Option<String>>::from_xml(iterator, inner_cipher)?
                            .value
                            .unwrap_or_default();
                    }
                    "Notes" => {
                        out.notes = SimpleTag::<Option<String>>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "Tags" => {
                        if let Some(tags) =
                            SimpleTag::<Option<String>>::from_xml(iterator, inner_cipher)?.value
                        {
                            out.tags = split_tags(&tags);
                        }
                    }
                    "IconID" => {
                        out.icon_id = SimpleTag::<Option<usize>>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "CustomIconUUID" => {
                        out.custom_icon_uuid =
                            SimpleTag::<Option<Uuid>>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "Times" => {
                        out.times = Times::from_xml(iterator, inner_cipher)?;
                    }
                    "IsExpanded" => {
                        out.is_expanded = SimpleTag::<bool>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "DefaultAutoTypeSequence" => {
                        out.default_autotype_sequence =
                            SimpleTag::<Option<String>>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "EnableAutoType" => {
                        out.enable_autotype =
                            SimpleTag::<Option<String>>::from_xml(iterator, inner_cipher)?
                                .value
                                .as_deref()
                                .and_then(parse_tristate);
                    }
                    "EnableSearching" => {
                        out.enable_searching =
                            SimpleTag::<Option<String>>::from_xml(iterator, inner_cipher)?
                                .value
                                .as_deref()
                                .and_then(parse_tristate);
                    }
                    "LastTopVisibleEntry" => {
                        out.last_top_visible_entry =
                            SimpleTag::<Option<Uuid>>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "PreviousParentGroup" => {
                        out.previous_parent_group =
                            SimpleTag::<Option<Uuid>>::from_xml(iterator, inner_cipher)?.value;
                    }
                    "CustomData" => {
                        out.custom_data = CustomData::from_xml(iterator, inner_cipher)?;
                    }
                    "Group" => {
                        let subgroup = Group::from_xml(iterator, inner_cipher)?;
                        out.add_child(subgroup);
                    }
                    "Entry" => {
                        let entry = Entry::from_xml(iterator, inner_cipher)?;
                        out.add_child(entry);
                    }
                    _ => {
                        IgnoreSubfield::from_xml(iterator, inner_cipher)?;
                    }
                },
                SimpleXmlEvent::End(name) if name == "Group" => break,
                _ => {
                    return Err(XmlParseError::BadEvent {
                        expected: "start tag or close Group",
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

/// Tags are stored as one string with `;` (or legacy `,`) separators
pub(crate) fn split_tags(tags: &str) -> Vec<String> {
    tags.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod group_parse_tests {
    use super::*;
    use crate::xml_db::parse::parse_from_bytes;

    fn parse_group(xml: &str) -> Result<Group, XmlParseError> {
        parse_from_bytes::<Group>(xml.as_bytes(), &mut crate::crypt::ciphers::PlainCipher)
    }

    #[test]
    fn nested_groups_and_entries() -> Result<(), XmlParseError> {
        let group = parse_group(
            "<Group>\
             <Name>Outer</Name>\
             <Group><Name>Inner</Name></Group>\
             <Entry><String><Key>Title</Key><Value>E</Value></String></Entry>\
             </Group>",
        )?;

        assert_eq!(group.name, "Outer");
        assert_eq!(group.groups().len(), 1);
        assert_eq!(group.groups()[0].name, "Inner");
        assert_eq!(group.entries().len(), 1);
        assert_eq!(group.entries()[0].get_title(), Some("E"));

        Ok(())
    }

    #[test]
    fn tristate_flags() -> Result<(), XmlParseError> {
        let group = parse_group(
            "<Group><EnableAutoType>null</EnableAutoType><EnableSearching>False</EnableSearching></Group>",
        )?;
        assert_eq!(group.enable_autotype, None);
        assert_eq!(group.enable_searching, Some(false));

        Ok(())
    }

    #[test]
    fn tag_splitting() {
        assert_eq!(split_tags("a;b;c"), vec!["a", "b", "c"]);
        assert_eq!(split_tags("a, b"), vec!["a", "b"]);
        assert_eq!(split_tags(""), Vec::<String>::new());
    }
}
