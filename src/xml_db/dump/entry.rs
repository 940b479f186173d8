use std::io::Write;

use base64::{engine::general_purpose as base64_engine, Engine as _};
use xml::writer::{EventWriter, XmlEvent as WriterEvent};

use crate::{
    db::{AutoType, AutoTypeAssociation, BinaryRef, Entry, History, Value},
    xml_db::dump::{crypto_error, DumpContext, DumpXml, SimpleTag},
};

impl DumpXml for Entry {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Entry"))?;

        SimpleTag("UUID", &self.uuid).dump_xml(writer, ctx)?;

        if let Some(value) = self.icon_id {
            SimpleTag("IconID", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.custom_icon_uuid {
            SimpleTag("CustomIconUUID", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.foreground_color {
            SimpleTag("ForegroundColor", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.background_color {
            SimpleTag("BackgroundColor", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.override_url {
            SimpleTag("OverrideURL", value).dump_xml(writer, ctx)?;
        }

        if let Some(value) = self.quality_check {
            SimpleTag("QualityCheck", value).dump_xml(writer, ctx)?;
        }

        if !self.tags.is_empty() {
            SimpleTag("Tags", &self.tags.join(";")).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.previous_parent_group {
            SimpleTag("PreviousParentGroup", value).dump_xml(writer, ctx)?;
        }

        self.times.dump_xml(writer, ctx)?;

        if !self.custom_data.items.is_empty() {
            self.custom_data.dump_xml(writer, ctx)?;
        }

        for (key, value) in &self.fields {
            writer.write(WriterEvent::start_element("String"))?;

            SimpleTag("Key", key).dump_xml(writer, ctx)?;
            value.dump_xml(writer, ctx)?;

            writer.write(WriterEvent::end_element())?; // String
        }

        for (key, binary) in &self.binaries {
            writer.write(WriterEvent::start_element("Binary"))?;

            SimpleTag("Key", key).dump_xml(writer, ctx)?;
            binary.dump_xml(writer, ctx)?;

            writer.write(WriterEvent::end_element())?; // Binary
        }

        if let Some(ref autotype) = self.autotype {
            autotype.dump_xml(writer, ctx)?;
        }

        // historical versions carry no History element of their own, so
        // recursion terminates after one level
        if let Some(ref history) = self.history {
            history.dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?; // Entry

        Ok(())
    }
}

impl DumpXml for Value {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        match self {
            Value::Unprotected(value) => SimpleTag("Value", value.as_str()).dump_xml(writer, ctx),
            Value::Bytes(value) => {
                let b64 = base64_engine::STANDARD.encode(value);
                SimpleTag("Value", &b64).dump_xml(writer, ctx)
            }
            Value::Protected(value) => {
                dump_protected_value(value.unsecure(), writer, ctx)
            }
            Value::Locked(locked) => {
                // decrypt through the safe, then re-encrypt with the inner
                // stream so locked databases serialize without unlocking
                let safe = ctx.safe.ok_or_else(|| {
                    xml::writer::Error::from(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "locked value without a database safe",
                    ))
                })?;

                let plaintext = safe.peek(locked.slot, &locked.ciphertext).ok_or_else(|| {
                    xml::writer::Error::from(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "locked value not covered by the database safe",
                    ))
                })?;

                dump_protected_value(&plaintext, writer, ctx)
            }
        }
    }
}

fn dump_protected_value<E: Write>(
    plaintext: &[u8],
    writer: &mut EventWriter<E>,
    ctx: &mut DumpContext<'_>,
) -> Result<(), xml::writer::Error> {
    let encrypted = ctx.cipher.encrypt(plaintext).map_err(crypto_error)?;
    let protected_value = base64_engine::STANDARD.encode(encrypted);

    writer.write(WriterEvent::start_element("Value").attr("Protected", "True"))?;
    writer.write(WriterEvent::characters(&protected_value))?;
    writer.write(WriterEvent::end_element())?;

    Ok(())
}

impl DumpXml for BinaryRef {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        match self {
            BinaryRef::Index(index) => {
                let reference = index.to_string();
                writer.write(WriterEvent::start_element("Value").attr("Ref", &reference))?;
                writer.write(WriterEvent::end_element())?;
            }
            BinaryRef::MetaRef(identifier) => {
                writer.write(WriterEvent::start_element("Value").attr("Ref", identifier))?;
                writer.write(WriterEvent::end_element())?;
            }
            BinaryRef::Inline(value) => {
                if value.protect {
                    let encrypted = ctx.cipher.encrypt(&value.data).map_err(crypto_error)?;
                    let b64 = base64_engine::STANDARD.encode(encrypted);
                    writer.write(WriterEvent::start_element("Value").attr("Protected", "True"))?;
                    writer.write(WriterEvent::characters(&b64))?;
                } else {
                    let b64 = base64_engine::STANDARD.encode(&value.data);
                    writer.write(WriterEvent::start_element("Value"))?;
                    writer.write(WriterEvent::characters(&b64))?;
                }
                writer.write(WriterEvent::end_element())?;
            }
        }

        Ok(())
    }
}

impl DumpXml for AutoType {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("AutoType"))?;

        SimpleTag("Enabled", self.enabled).dump_xml(writer, ctx)?;

        if let Some(value) = self.data_transfer_obfuscation {
            SimpleTag("DataTransferObfuscation", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.sequence {
            SimpleTag("DefaultSequence", value).dump_xml(writer, ctx)?;
        }

        for association in &self.associations {
            association.dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?; // AutoType

        Ok(())
    }
}

impl DumpXml for AutoTypeAssociation {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Association"))?;

        if let Some(ref value) = self.window {
            SimpleTag("Window", value).dump_xml(writer, ctx)?;
        }

        if let Some(ref value) = self.sequence {
            SimpleTag("KeystrokeSequence", value).dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?; // Association

        Ok(())
    }
}

impl DumpXml for History {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("History"))?;

        for entry in &self.entries {
            entry.dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?; // History

        Ok(())
    }
}
