//! The per-connection record registry: the local roster (static base plus
//! dynamically added per-source order records), server-id mappings, and
//! the field digests negotiated through `DESCRIBE_RECORDS`.

use super::schema::{base_records, FieldInfo, RecordId, RecordInfo, RecordKind, ORDER_FIELDS};
use crate::protocol::FieldType;
use crate::{FeedError, FeedResult};
use vec_map::VecMap;

/// One decode directive: consume a value of `field_type` and hand it to
/// the setter; a void directive feeds the setter from the default getter.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FieldDirective {
    pub field_type: FieldType,
    pub field: Option<&'static FieldInfo>,
}

/// The ordered decode plan for one record, valid while `in_sync`.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordDigest {
    pub directives: Vec<FieldDirective>,
    pub in_sync: bool,
}

/// What a server-assigned record id resolves to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ServerRecordEntry {
    pub record: RecordId,
    /// Exchange suffix carried by the server's record name (`Quote&A`),
    /// `'\0'` for composite records.
    pub exchange_code: char,
}

#[derive(Debug)]
pub(crate) struct RecordRegistry {
    records: Vec<RecordInfo>,
    /// Whether the record has been announced to the server yet; cleared on
    /// reconnect so the whole roster is re-announced.
    described: Vec<bool>,
    digests: Vec<RecordDigest>,
    /// Which local fields the server announced, one bit per field index.
    support_bits: Vec<u64>,
    server_by_local: Vec<Option<i32>>,
    local_by_server: VecMap<ServerRecordEntry>,
}

impl Default for RecordRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordRegistry {
    pub fn new() -> Self {
        let records = base_records();
        let n = records.len();
        Self {
            records,
            described: vec![false; n],
            digests: vec![RecordDigest::default(); n],
            support_bits: vec![0; n],
            server_by_local: vec![None; n],
            local_by_server: VecMap::new(),
        }
    }

    pub fn record(&self, id: RecordId) -> &RecordInfo {
        &self.records[id]
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn digest(&self, id: RecordId) -> &RecordDigest {
        &self.digests[id]
    }

    pub fn find_by_name(&self, name: &str) -> Option<RecordId> {
        self.records.iter().position(|r| r.name == name)
    }

    /// The record id used on the wire for subscriptions: the server's,
    /// once it has renumbered the record, the local one until then.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn wire_record_id(&self, id: RecordId) -> i32 {
        self.server_by_local[id].unwrap_or(id as i32)
    }

    /// Registers (or finds) the per-source order record `Order#source`.
    pub fn ensure_order_record(&mut self, source: &str) -> RecordId {
        let name = format!("Order#{source}");
        if let Some(id) = self.find_by_name(&name) {
            return id;
        }
        self.records.push(RecordInfo {
            name,
            kind: RecordKind::Order,
            fields: ORDER_FIELDS,
        });
        self.described.push(false);
        self.digests.push(RecordDigest::default());
        self.support_bits.push(0);
        self.server_by_local.push(None);
        self.records.len() - 1
    }

    /// Resolves a server record id from a DATA frame.
    pub fn resolve_server_id(&self, server_id: i32) -> Option<ServerRecordEntry> {
        let key = usize::try_from(server_id).ok()?;
        self.local_by_server.get(key).copied()
    }

    /// Records not yet announced to the server, marking them announced.
    /// This is the payload cursor for `DESCRIBE_RECORDS` sends.
    pub fn take_undescribed(&mut self) -> Vec<RecordId> {
        let mut out = Vec::new();
        for (id, described) in self.described.iter_mut().enumerate() {
            if !*described {
                *described = true;
                out.push(id);
            }
        }
        out
    }

    /// Drops all server-negotiated state; the connection is starting over.
    pub fn clear_server_info(&mut self) {
        for bits in &mut self.support_bits {
            *bits = 0;
        }
        for digest in &mut self.digests {
            *digest = RecordDigest::default();
        }
        for described in &mut self.described {
            *described = false;
        }
        for server in &mut self.server_by_local {
            *server = None;
        }
        self.local_by_server.clear();
    }

    /// Splits a server record name into the local base name and the
    /// optional single-character exchange suffix.
    fn split_exchange_suffix(name: &str) -> (&str, char) {
        if let Some((base, suffix)) = name.split_once('&') {
            let mut chars = suffix.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                return (base, c);
            }
        }
        (name, '\0')
    }

    /// Begins a (re-)description of `server_name` under `server_id`.
    ///
    /// Returns the local record being described, or `None` for a record
    /// this client does not know (the caller still consumes the field
    /// list to stay in sync with the message).
    pub fn begin_describe(
        &mut self,
        server_id: i32,
        server_name: &str,
    ) -> FeedResult<Option<RecordId>> {
        if server_id < 0 {
            return Err(FeedError::RecordInfoCorrupted);
        }
        let (base, exchange_code) = Self::split_exchange_suffix(server_name);
        let Some(record) = self.find_by_name(base) else {
            return Ok(None);
        };
        self.server_by_local[record] = Some(server_id);
        #[allow(clippy::cast_sign_loss)]
        self.local_by_server.insert(
            server_id as usize,
            ServerRecordEntry {
                record,
                exchange_code,
            },
        );
        // The digest is replaced wholesale; DATA must not observe a
        // half-built one.
        self.support_bits[record] = 0;
        self.digests[record] = RecordDigest::default();
        Ok(Some(record))
    }

    /// Matches one announced server field against the local record.
    ///
    /// A match requires name and type equality; the directive then carries
    /// the field's setter. Unmatched server fields get a consume-only
    /// directive.
    pub fn digest_server_field(
        &mut self,
        record: RecordId,
        field_name: &str,
        field_type: FieldType,
    ) -> FeedResult<()> {
        if field_name.is_empty() || !field_type.is_in_wire_range() {
            return Err(FeedError::RecordInfoCorrupted);
        }
        let fields: &'static [FieldInfo] = self.records[record].fields;
        let matched = fields
            .iter()
            .position(|f| f.name == field_name && f.field_type == field_type);
        let directive = FieldDirective {
            field_type,
            field: matched.map(|i| &fields[i]),
        };
        if let Some(i) = matched {
            self.support_bits[record] |= 1 << i;
        }
        self.digests[record].directives.push(directive);
        Ok(())
    }

    /// Appends void directives for the local fields the server did not
    /// announce, so decoding yields their schema defaults, and marks the
    /// record in sync.
    pub fn finish_describe(&mut self, record: RecordId) {
        let fields: &'static [FieldInfo] = self.records[record].fields;
        let bits = self.support_bits[record];
        for (i, field) in fields.iter().enumerate() {
            if bits & (1 << i) == 0 {
                self.digests[record].directives.push(FieldDirective {
                    field_type: FieldType::VOID,
                    field: Some(field),
                });
            }
        }
        self.digests[record].in_sync = true;
    }
}
