mod entry;
mod group;
mod meta;

use std::io::Write;

use base64::{engine::general_purpose as base64_engine, Engine as _};
use uuid::Uuid;
use xml::{
    writer::{EventWriter, XmlEvent as WriterEvent},
    EmitterConfig,
};

use crate::{
    crypt::ciphers::Cipher,
    db::{Color, CustomData, CustomDataItem, Database, DeletedObject, DeletedObjects, Safe, Times},
    error::CryptographyError,
    xml_db::get_epoch_baseline,
};

/// State threaded through the XML serialization: the inner stream cipher
/// (advancing in document order) and, for locked databases, the safe that
/// holds the protected plaintexts.
pub(crate) struct DumpContext<'a> {
    pub(crate) cipher: &'a mut dyn Cipher,
    pub(crate) safe: Option<&'a Safe>,
}

impl<'a> DumpContext<'a> {
    pub(crate) fn new(cipher: &'a mut dyn Cipher, safe: Option<&'a Safe>) -> Self {
        Self { cipher, safe }
    }
}

pub(crate) fn crypto_error(e: CryptographyError) -> xml::writer::Error {
    xml::writer::Error::from(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Format a timestamp for the XML body: Base64 of the little-endian second
/// count since the format epoch
pub fn format_xml_timestamp(timestamp: &chrono::NaiveDateTime) -> String {
    let seconds = timestamp.and_utc().timestamp() - get_epoch_baseline().and_utc().timestamp();
    base64_engine::STANDARD.encode(seconds.to_le_bytes())
}

pub(crate) fn dump(
    db: &Database,
    ctx: &mut DumpContext<'_>,
    writer: &mut dyn Write,
) -> Result<(), xml::writer::Error> {
    let mut xml_writer = EmitterConfig::new().perform_indent(false).create_writer(writer);

    db.dump_xml(&mut xml_writer, ctx)?;

    Ok(())
}

/// A trait that denotes that a KDBX database object can be stored into an
/// XML database.
///
/// Using an `xml::writer::EventWriter` and the dump context, emit a series
/// of `XmlEvent`s to the writer to build up the XML document.
pub(crate) trait DumpXml {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error>;

    fn normalize_empty_elements(&self) -> bool {
        false
    }
}

impl DumpXml for &chrono::NaiveDateTime {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(&format_xml_timestamp(self)))
    }
}

impl DumpXml for bool {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(if *self { "True" } else { "False" }))
    }
}

/// Tri-state flags serialize their inherit-from-parent state as `null`
pub(crate) struct TriState(pub Option<bool>);

impl DumpXml for TriState {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        let s = match self.0 {
            Some(true) => "True",
            Some(false) => "False",
            None => "null",
        };
        writer.write(WriterEvent::characters(s))
    }
}

impl DumpXml for usize {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(&format!("{}", self)))
    }
}

impl DumpXml for isize {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(&format!("{}", self)))
    }
}

impl DumpXml for &str {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(self))
    }

    fn normalize_empty_elements(&self) -> bool {
        self.is_empty()
    }
}

impl DumpXml for &String {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(self))
    }

    fn normalize_empty_elements(&self) -> bool {
        self.is_empty()
    }
}

impl DumpXml for &Uuid {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        let b64 = base64_engine::STANDARD.encode(self.as_bytes());
        writer.write(WriterEvent::characters(&b64))
    }
}

impl DumpXml for &Color {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        _ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::characters(&self.to_string()))
    }
}

/// Convenience type for simplified serialization of single-value elements.
pub(crate) struct SimpleTag<S: AsRef<str>, D: DumpXml>(pub S, pub D);

impl<S: AsRef<str>, D: DumpXml> DumpXml for SimpleTag<S, D> {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element(self.0.as_ref()))?;
        if !self.1.normalize_empty_elements() {
            self.1.dump_xml(writer, ctx)?;
        }
        writer.write(WriterEvent::end_element())?;
        Ok(())
    }
}

impl DumpXml for Database {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("KeePassFile"))?;

        self.meta.dump_xml(writer, ctx)?;

        writer.write(WriterEvent::start_element("Root"))?;

        self.root.dump_xml(writer, ctx)?;

        self.deleted_objects.dump_xml(writer, ctx)?;

        writer.write(WriterEvent::end_element())?; // Root

        writer.write(WriterEvent::end_element())?; // KeePassFile

        Ok(())
    }
}

impl DumpXml for Times {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("Times"))?;

        // emit in a stable order so serialization is deterministic
        let mut names: Vec<&String> = self.times.keys().collect();
        names.sort();

        for name in names {
            if let Some(time) = self.times.get(name) {
                SimpleTag(name, time).dump_xml(writer, ctx)?;
            }
        }

        SimpleTag("Expires", self.expires).dump_xml(writer, ctx)?;
        SimpleTag("UsageCount", self.usage_count).dump_xml(writer, ctx)?;

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}

impl DumpXml for CustomData {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("CustomData"))?;

        for (key, item) in &self.items {
            writer.write(WriterEvent::start_element("Item"))?;

            SimpleTag("Key", key).dump_xml(writer, ctx)?;
            item.dump_xml(writer, ctx)?;

            writer.write(WriterEvent::end_element())?;
        }

        writer.write(WriterEvent::end_element())?;

        Ok(())
    }
}

impl DumpXml for CustomDataItem {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        if let Some(ref value) = self.value {
            value.dump_xml(writer, ctx)?;
        }

        if let Some(ref time) = self.last_modification_time {
            SimpleTag("LastModificationTime", time).dump_xml(writer, ctx)?;
        }

        Ok(())
    }
}

impl DumpXml for DeletedObjects {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("DeletedObjects"))?;

        for object in &self.objects {
            object.dump_xml(writer, ctx)?;
        }

        writer.write(WriterEvent::end_element())?;
        Ok(())
    }
}

impl DumpXml for DeletedObject {
    fn dump_xml<E: Write>(
        &self,
        writer: &mut EventWriter<E>,
        ctx: &mut DumpContext<'_>,
    ) -> Result<(), xml::writer::Error> {
        writer.write(WriterEvent::start_element("DeletedObject"))?;

        SimpleTag("UUID", &self.uuid).dump_xml(writer, ctx)?;
        SimpleTag("DeletionTime", &self.deletion_time).dump_xml(writer, ctx)?;

        writer.write(WriterEvent::end_element())?;
        Ok(())
    }
}
