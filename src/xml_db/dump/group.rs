use std::io::Write;

use xml::writer::{EventWriter, XmlEvent as WriterEvent};

use crate::{
    db::{Group, Node},
    xml_db::dump::{DumpContext, DumpXml, SimpleTag, TriState},
};

impl DumpXml for Group {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Group"))?;

        SimpleTag("UUID", &self.uuid).dump_xml(writer, ctx)?;
        SimpleTag("Name", &self.name).dump_xml(writer, ctx)?;

        if let Some(ref value) = self.notes {
            SimpleTag("Notes", value).dump_xml(writer, ctx)?;
        }

        if !self.tags.is_empty() {
            SimpleTag("Tags", &self.tags.join(";")).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.icon_id {
            SimpleTag("IconID", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.custom_icon_uuid {
            SimpleTag("CustomIconUUID", value).dump_xml(writer, ctx)?;
        }

        self.times.dump_xml(writer, ctx)?;

        SimpleTag("IsExpanded", self.is_expanded).dump_xml(writer, ctx)?;

        if let Some(ref value) = self.default_autotype_sequence {
            SimpleTag("DefaultAutoTypeSequence", value).dump_xml(writer, ctx)?;
        }

        SimpleTag("EnableAutoType", TriState(self.enable_autotype)).dump_xml(writer, ctx)?;
        SimpleTag("EnableSearching", TriState(self.enable_searching)).dump_xml(writer, ctx)?;

        if let Some(ref value) = self.last_top_visible_entry {
            SimpleTag("LastTopVisibleEntry", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.previous_parent_group {
            SimpleTag("PreviousParentGroup", value).dump_xml(writer, ctx)?;
        }

        if !self.custom_data.items.is_empty() {
            self.custom_data.dump_xml(writer, ctx)?;
        }

        // children keep their stored order so that the inner stream cipher
        // sees protected values exactly as the parser will
        for node in &self.children {
            match node {
                Node::Entry(entry) => entry.dump_xml(writer, ctx)?,
                Node::Group(group) => group.dump_xml(writer, ctx)?,
            }
        }

        writer.write(WriterEvent::end_element())?; // Group

        Ok(())
    }
}
