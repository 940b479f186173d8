use std::io::Write;

use base64::{engine::general_purpose as base64_engine, Engine as _};
use xml::writer::{EventWriter, XmlEvent as WriterEvent};

use crate::{
    db::{BinaryAttachment, BinaryAttachments, CustomIcons, Icon, MemoryProtection, Meta},
    xml_db::dump::{DumpContext, DumpXml, SimpleTag},
};

impl DumpXml for Meta {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Meta"))?;

        if let Some(ref value) = self.generator {
            SimpleTag("Generator", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.header_hash {
            let b64 = base64_engine::STANDARD.encode(value);
            SimpleTag("HeaderHash", &b64).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.database_name {
            SimpleTag("DatabaseName", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.database_name_changed {
            SimpleTag("DatabaseNameChanged", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.database_description {
            SimpleTag("DatabaseDescription", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.database_description_changed {
            SimpleTag("DatabaseDescriptionChanged", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.default_username {
            SimpleTag("DefaultUserName", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.default_username_changed {
            SimpleTag("DefaultUserNameChanged", value).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.maintenance_history_days {
            SimpleTag("MaintenanceHistoryDays", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.color {
            SimpleTag("Color", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.master_key_changed {
            SimpleTag("MasterKeyChanged", value).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.master_key_change_rec {
            SimpleTag("MasterKeyChangeRec", value).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.master_key_change_force {
            SimpleTag("MasterKeyChangeForce", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.memory_protection {
            value.dump_xml(writer, ctx)?;
        }

        if !self.custom_icons.icons.is_empty() {
            self.custom_icons.dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.recyclebin_enabled {
            SimpleTag("RecycleBinEnabled", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.recyclebin_uuid {
            SimpleTag("RecycleBinUUID", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.recyclebin_changed {
            SimpleTag("RecycleBinChanged", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.entry_templates_group {
            SimpleTag("EntryTemplatesGroup", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.entry_templates_group_changed {
            SimpleTag("EntryTemplatesGroupChanged", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.last_selected_group {
            SimpleTag("LastSelectedGroup", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.last_top_visible_group {
            SimpleTag("LastTopVisibleGroup", value).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.history_max_items {
            SimpleTag("HistoryMaxItems", value).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.history_max_size {
            SimpleTag("HistoryMaxSize", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.settings_changed {
            SimpleTag("SettingsChanged", value).dump_xml(writer, ctx)?;
        }

        if !self.binaries.binaries.is_empty() {
            self.binaries.dump_xml(writer, ctx)?;
        }

        if !self.custom_data.items.is_empty() {
            self.custom_data.dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?; // Meta

        Ok(())
    }
}

impl DumpXml for MemoryProtection {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("MemoryProtection"))?;

        SimpleTag("ProtectTitle", self.protect_title).dump_xml(writer, ctx)?;
        SimpleTag("ProtectUserName", self.protect_username).dump_xml(writer, ctx)?;
        SimpleTag("ProtectPassword", self.protect_password).dump_xml(writer, ctx)?;
        SimpleTag("ProtectURL", self.protect_url).dump_xml(writer, ctx)?;
        SimpleTag("ProtectNotes", self.protect_notes).dump_xml(writer, ctx)?;

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}

impl DumpXml for CustomIcons {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("CustomIcons"))?;

        for icon in &self.icons {
            icon.dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}

impl DumpXml for Icon {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Icon"))?;

        SimpleTag("UUID", &self.uuid).dump_xml(writer, ctx)?;

        let b64 = base64_engine::STANDARD.encode(&self.data);
        SimpleTag("Data", &b64).dump_xml(writer, ctx)?;

        if let Some(ref name) = self.name {
            SimpleTag("Name", name).dump_xml(writer, ctx)?;
        }

        if let Some(ref time) = self.last_modification_time {
            SimpleTag("LastModificationTime", time).dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}

impl DumpXml for BinaryAttachments {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Binaries"))?;

        for binary in &self.binaries {
            binary.dump_xml(writer, _ctx)?;
        }

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}

impl DumpXml for BinaryAttachment {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        let mut element = WriterEvent::start_element("Binary");

        if let Some(ref identifier) = self.identifier {
            element = element.attr("ID", identifier);
        }
        if self.compressed {
            element = element.attr("Compressed", "True");
        }

        writer.write(element)?;

        let b64 = base64_engine::STANDARD.encode(&self.content);
        writer.write(WriterEvent::characters(&b64))?;

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}
