use std::collections::BTreeMap;

use crate::bytecode::{listing, DecodeError, NameIndex};
use crate::container::Container;
use crate::repack::{repack_messages, repack_strings};
use crate::scan::{scan, MessageRef, ScanResult};
use crate::translation::{read_messages, read_strings, write_messages, write_strings};
use crate::Result;

/// A loaded script together with the lookups and scan results derived from
/// it. Imports rebuild a copy of the container and only replace `self` once
/// the copy has been rescanned successfully.
#[derive(Debug, Clone)]
pub struct Script {
    container: Container,
    names: NameIndex,
    scan: ScanResult,
}

impl Script {
    pub fn load(data: &[u8]) -> Result<Self> {
        let container = Container::parse(data)?;
        let script = Self::from_container(container)?;
        log::info!(
            "loaded script: {} messages, {} message references, {} string references",
            script.container.messages.len(),
            script.scan.messages.len(),
            script.scan.string_refs.len()
        );
        Ok(script)
    }

    pub fn from_container(container: Container) -> Result<Self> {
        let names = NameIndex::build(&container);
        let scan = scan(&container, &names)?;
        Ok(Self {
            container,
            names,
            scan,
        })
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let bytes = self.container.to_bytes()?;
        log::info!("saved script: {} bytes", bytes.len());
        Ok(bytes)
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Message and character-name references in code order.
    pub fn messages(&self) -> &[MessageRef] {
        &self.scan.messages
    }

    /// LOADSTRING address to string offset.
    pub fn string_refs(&self) -> &BTreeMap<u32, u32> {
        &self.scan.string_refs
    }

    /// Distinct referenced strings, by offset.
    pub fn strings(&self) -> BTreeMap<u32, String> {
        self.scan.strings(&self.container)
    }

    pub fn export_messages(&self) -> String {
        write_messages(&self.scan.messages)
    }

    pub fn export_strings(&self) -> String {
        write_strings(&self.strings())
    }

    /// Apply a message translation file. Indices missing from the file keep
    /// their current text, which must lie inside the message segment.
    pub fn import_messages(&mut self, text: &str) -> Result<()> {
        let count = self.container.messages.len();
        let edits = read_messages(text, count)?;

        let mut replaced: Vec<Option<&str>> = vec![None; count];
        for (index, msg) in &edits {
            replaced[*index as usize] = Some(msg.as_str());
        }
        let texts = replaced
            .into_iter()
            .enumerate()
            .map(|(index, msg)| match msg {
                Some(msg) => Ok(msg.to_string()),
                None => self.current_message(index),
            })
            .collect::<std::result::Result<Vec<String>, DecodeError>>()?;

        let mut container = self.container.clone();
        repack_messages(&mut container, &texts)?;
        self.commit(container)?;
        log::info!("imported {} message lines", edits.len());
        Ok(())
    }

    /// Apply a string translation file. Offsets missing from the file keep
    /// their current text.
    pub fn import_strings(&mut self, text: &str) -> Result<()> {
        let mut strings = self.strings();
        let edits = read_strings(text, &strings)?;
        let edited = edits.len();
        strings.extend(edits);

        let mut container = self.container.clone();
        repack_strings(&mut container, &self.scan.string_refs, &strings)?;
        self.commit(container)?;
        log::info!("imported {} string lines", edited);
        Ok(())
    }

    pub fn listing(&self) -> Result<String> {
        Ok(listing(&self.container, &self.names)?)
    }

    fn current_message(&self, index: usize) -> std::result::Result<String, DecodeError> {
        self.container.message_text(index as u32).ok_or_else(|| {
            let entry = self.container.messages[index];
            DecodeError::MessageRange {
                index,
                offset: entry.offset,
                length: entry.length,
            }
        })
    }

    fn commit(&mut self, container: Container) -> Result<()> {
        let scan = scan(&container, &self.names)?;
        self.container = container;
        self.scan = scan;
        Ok(())
    }
}
