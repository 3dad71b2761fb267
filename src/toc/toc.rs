use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::toc::value::ValueType;

/// Decodes the type byte of a TOC element into its value type and a 'read only' flag. Each
///  subsystem has its own encoding.
pub type TypeDecoder = fn(u8) -> anyhow::Result<(ValueType, bool)>;

/// A variable that the vehicle exposes. Its `id` is the remote index which is used on the wire,
///  and which is stable for the current connection only.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TocElement {
    pub id: u8,
    pub group: String,
    pub name: String,
    pub value_type: ValueType,
    pub read_only: bool,
}

impl TocElement {
    /// Parses an element from `[id, type, group\0name\0]`
    pub fn parse(buf: &[u8], decode_type: TypeDecoder) -> anyhow::Result<TocElement> {
        if buf.len() < 2 {
            bail!("TOC element is too short: {} bytes", buf.len());
        }
        let id = buf[0];
        let (value_type, read_only) = decode_type(buf[1])?;

        let mut strings = buf[2..].split(|b| *b == 0);
        let group = strings.next().ok_or_else(|| anyhow!("TOC element {} has no group", id))?;
        let name = strings.next().ok_or_else(|| anyhow!("TOC element {} has no name", id))?;
        if strings.next().is_none() {
            bail!("TOC element {}: name is not null terminated", id);
        }

        Ok(TocElement {
            id,
            group: String::from_utf8(group.to_vec())?,
            name: String::from_utf8(name.to_vec())?,
            value_type,
            read_only,
        })
    }

    pub fn complete_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }

    /// serializes the element in the format that [TocElement::parse] reads
    pub fn ser(&self, type_byte: u8) -> Vec<u8> {
        let mut result = vec![self.id, type_byte];
        result.extend_from_slice(self.group.as_bytes());
        result.push(0);
        result.extend_from_slice(self.name.as_bytes());
        result.push(0);
        result
    }
}

/// The table of contents of one subsystem, i.e. the catalog of variables the vehicle exposes
///  for logging or as parameters. Elements are looked up by complete name (`group.name`) or by id.
#[derive(Clone, Default)]
pub struct Toc {
    crc: Option<u32>,
    by_name: FxHashMap<String, Arc<TocElement>>,
    by_id: BTreeMap<u8, Arc<TocElement>>,
}

impl Debug for Toc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Toc{{crc:{:?}, {} elements}}", self.crc, self.by_id.len())
    }
}

impl Toc {
    pub fn new(crc: Option<u32>) -> Toc {
        Toc {
            crc,
            ..Default::default()
        }
    }

    pub fn insert(&mut self, element: TocElement) {
        let element = Arc::new(element);
        self.by_name.insert(element.complete_name(), element.clone());
        self.by_id.insert(element.id, element);
    }

    pub fn get(&self, complete_name: &str) -> Option<&TocElement> {
        self.by_name.get(complete_name)
            .map(|e| e.as_ref())
    }

    pub fn get_by_id(&self, id: u8) -> Option<&TocElement> {
        self.by_id.get(&id)
            .map(|e| e.as_ref())
    }

    pub fn crc(&self) -> Option<u32> {
        self.crc
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// all elements, ordered by id
    pub fn elements(&self) -> impl Iterator<Item = &TocElement> {
        self.by_id.values()
            .map(|e| e.as_ref())
    }
}

/// In-memory cache of fetched TOCs, keyed by port and CRC. The vehicle reports its TOC's CRC
///  before any elements are fetched, so a known TOC can be reused without downloading it again.
#[derive(Default)]
pub struct TocCache {
    tocs: RwLock<FxHashMap<(u8, u32), Arc<Toc>>>,
}

impl TocCache {
    pub fn new() -> TocCache {
        Default::default()
    }

    pub async fn get(&self, port: u8, crc: u32) -> Option<Arc<Toc>> {
        self.tocs.read().await
            .get(&(port, crc))
            .cloned()
    }

    /// TOCs without CRC are not cached
    pub async fn insert(&self, port: u8, toc: Arc<Toc>) {
        if let Some(crc) = toc.crc() {
            self.tocs.write().await
                .insert((port, crc), toc);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn decode_type(b: u8) -> anyhow::Result<(ValueType, bool)> {
        match b & 0x0F {
            1 => Ok((ValueType::U8, false)),
            2 => Ok((ValueType::U16, b & 0x40 != 0)),
            _ => bail!("unknown type {}", b),
        }
    }

    fn element(id: u8, group: &str, name: &str) -> TocElement {
        TocElement {
            id,
            group: group.to_string(),
            name: name.to_string(),
            value_type: ValueType::U8,
            read_only: false,
        }
    }

    #[rstest]
    #[case::simple(b"\x03\x01pm\0vbat\0", Some(TocElement { id: 3, group: "pm".to_string(), name: "vbat".to_string(), value_type: ValueType::U8, read_only: false }))]
    #[case::read_only(b"\x00\x42a\0b\0", Some(TocElement { id: 0, group: "a".to_string(), name: "b".to_string(), value_type: ValueType::U16, read_only: true }))]
    #[case::trailing_garbage(b"\x00\x01a\0b\0xyz", Some(element(0, "a", "b")))]
    #[case::unknown_type(b"\x00\x07a\0b\0", None)]
    #[case::no_name(b"\x00\x01a\0", None)]
    #[case::unterminated_name(b"\x00\x01a\0b", None)]
    #[case::too_short(b"\x00", None)]
    fn test_parse(#[case] buf: &[u8], #[case] expected: Option<TocElement>) {
        assert_eq!(TocElement::parse(buf, decode_type).ok(), expected);
    }

    #[test]
    fn test_ser_parse() {
        let original = element(17, "stabilizer", "roll");
        let buf = original.ser(1);
        assert_eq!(TocElement::parse(&buf, decode_type).unwrap(), original);
    }

    #[test]
    fn test_same_name_in_different_groups() {
        let mut toc = Toc::new(None);
        toc.insert(element(0, "acc", "x"));
        toc.insert(element(1, "gyro", "x"));

        assert_eq!(toc.len(), 2);
        assert_eq!(toc.get("acc.x").unwrap().id, 0);
        assert_eq!(toc.get("gyro.x").unwrap().id, 1);
        assert_eq!(toc.get_by_id(1).unwrap().complete_name(), "gyro.x");
        assert!(toc.get("x").is_none());
        assert_eq!(toc.elements().map(|e| e.id).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_cache() {
        let cache = TocCache::new();

        let mut toc = Toc::new(Some(0x1234));
        toc.insert(element(0, "a", "b"));
        cache.insert(5, Arc::new(toc)).await;
        cache.insert(5, Arc::new(Toc::new(None))).await;

        assert_eq!(cache.get(5, 0x1234).await.unwrap().len(), 1);
        assert!(cache.get(2, 0x1234).await.is_none());
        assert!(cache.get(5, 0x4321).await.is_none());
    }
}
