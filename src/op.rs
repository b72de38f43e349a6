//! Operation model and on-disk codec.
//!
//! Each appended record is framed as
//! `size: i32 | tag: u8 | body | checksum: u32` where `size` covers
//! everything after itself and the checksum covers tag + body only. Bodies
//! carry their own serialization format number so fields added over time can
//! be skipped when replaying logs written by older code: a field introduced
//! at format N is read only when the stored format is >= N, and defaults
//! otherwise.

use std::fmt;

use crate::errors::{TranslogError, TranslogResult};
use crate::stream::{ChecksumInput, ChecksumOutput};

/// Version-matching semantics attached to an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionType {
    #[default]
    Internal,
    External,
    ExternalGte,
    Force,
}

impl VersionType {
    pub fn id(self) -> u8 {
        match self {
            VersionType::Internal => 0,
            VersionType::External => 1,
            VersionType::ExternalGte => 2,
            VersionType::Force => 3,
        }
    }

    pub fn from_id(id: u8) -> TranslogResult<Self> {
        match id {
            0 => Ok(VersionType::Internal),
            1 => Ok(VersionType::External),
            2 => Ok(VersionType::ExternalGte),
            3 => Ok(VersionType::Force),
            other => Err(TranslogError::Corrupted(format!(
                "no version type mapped for [{other}]"
            ))),
        }
    }
}

/// Borrowed view of the document payload carried by a create/index operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source<'a> {
    pub source: &'a [u8],
    pub routing: Option<&'a str>,
    pub parent: Option<&'a str>,
    pub timestamp: i64,
    pub ttl: i64,
}

/// Document creation. Distinct from [`Index`] on the wire so replay can tell
/// a strict create (must not exist) from a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create {
    pub id: String,
    pub doc_type: String,
    pub source: Vec<u8>,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub timestamp: i64,
    pub ttl: i64,
    pub version: i64,
    pub version_type: VersionType,
}

impl Create {
    const SERIALIZATION_FORMAT: u32 = 6;

    pub fn new(doc_type: impl Into<String>, id: impl Into<String>, source: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            source,
            routing: None,
            parent: None,
            timestamp: 0,
            ttl: 0,
            version: 0,
            version_type: VersionType::Internal,
        }
    }

    fn write_body(&self, out: &mut ChecksumOutput) {
        out.write_vint(Self::SERIALIZATION_FORMAT);
        write_doc_fields(
            out,
            &self.id,
            &self.doc_type,
            &self.source,
            self.routing.as_deref(),
            self.parent.as_deref(),
            self.version,
            self.timestamp,
            self.ttl,
            self.version_type,
        );
    }

    fn read_body(input: &mut ChecksumInput<'_>) -> TranslogResult<Self> {
        let fields = read_doc_fields(input)?;
        Ok(Self {
            id: fields.id,
            doc_type: fields.doc_type,
            source: fields.source,
            routing: fields.routing,
            parent: fields.parent,
            timestamp: fields.timestamp,
            ttl: fields.ttl,
            version: fields.version,
            version_type: fields.version_type,
        })
    }
}

/// Document save (index). Same body layout as [`Create`], different tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub id: String,
    pub doc_type: String,
    pub source: Vec<u8>,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub timestamp: i64,
    pub ttl: i64,
    pub version: i64,
    pub version_type: VersionType,
}

impl Index {
    const SERIALIZATION_FORMAT: u32 = 6;

    pub fn new(doc_type: impl Into<String>, id: impl Into<String>, source: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            source,
            routing: None,
            parent: None,
            timestamp: 0,
            ttl: 0,
            version: 0,
            version_type: VersionType::Internal,
        }
    }

    fn write_body(&self, out: &mut ChecksumOutput) {
        out.write_vint(Self::SERIALIZATION_FORMAT);
        write_doc_fields(
            out,
            &self.id,
            &self.doc_type,
            &self.source,
            self.routing.as_deref(),
            self.parent.as_deref(),
            self.version,
            self.timestamp,
            self.ttl,
            self.version_type,
        );
    }

    fn read_body(input: &mut ChecksumInput<'_>) -> TranslogResult<Self> {
        let fields = read_doc_fields(input)?;
        Ok(Self {
            id: fields.id,
            doc_type: fields.doc_type,
            source: fields.source,
            routing: fields.routing,
            parent: fields.parent,
            timestamp: fields.timestamp,
            ttl: fields.ttl,
            version: fields.version,
            version_type: fields.version_type,
        })
    }
}

/// Decoded field layout shared by create/index bodies.
struct DocFields {
    id: String,
    doc_type: String,
    source: Vec<u8>,
    routing: Option<String>,
    parent: Option<String>,
    timestamp: i64,
    ttl: i64,
    version: i64,
    version_type: VersionType,
}

#[allow(clippy::too_many_arguments)]
fn write_doc_fields(
    out: &mut ChecksumOutput,
    id: &str,
    doc_type: &str,
    source: &[u8],
    routing: Option<&str>,
    parent: Option<&str>,
    version: i64,
    timestamp: i64,
    ttl: i64,
    version_type: VersionType,
) {
    out.write_string(id);
    out.write_string(doc_type);
    out.write_bytes(source);
    match routing {
        Some(routing) => {
            out.write_bool(true);
            out.write_string(routing);
        }
        None => out.write_bool(false),
    }
    match parent {
        Some(parent) => {
            out.write_bool(true);
            out.write_string(parent);
        }
        None => out.write_bool(false),
    }
    out.write_i64(version);
    out.write_i64(timestamp);
    out.write_i64(ttl);
    out.write_u8(version_type.id());
}

fn read_doc_fields(input: &mut ChecksumInput<'_>) -> TranslogResult<DocFields> {
    let format = input.read_vint()?;
    let id = input.read_string()?;
    let doc_type = input.read_string()?;
    let source = input.read_bytes()?;
    let mut fields = DocFields {
        id,
        doc_type,
        source,
        routing: None,
        parent: None,
        timestamp: 0,
        ttl: 0,
        version: 0,
        version_type: VersionType::Internal,
    };
    if format >= 1 && input.read_bool()? {
        fields.routing = Some(input.read_string()?);
    }
    if format >= 2 && input.read_bool()? {
        fields.parent = Some(input.read_string()?);
    }
    if format >= 3 {
        fields.version = input.read_i64()?;
    }
    if format >= 4 {
        fields.timestamp = input.read_i64()?;
    }
    if format >= 5 {
        fields.ttl = input.read_i64()?;
    }
    if format >= 6 {
        fields.version_type = VersionType::from_id(input.read_u8()?)?;
    }
    Ok(fields)
}

/// Document deletion by uid term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub uid_field: String,
    pub uid_text: String,
    pub version: i64,
    pub version_type: VersionType,
}

impl Delete {
    const SERIALIZATION_FORMAT: u32 = 2;

    pub fn new(uid_field: impl Into<String>, uid_text: impl Into<String>) -> Self {
        Self {
            uid_field: uid_field.into(),
            uid_text: uid_text.into(),
            version: 0,
            version_type: VersionType::Internal,
        }
    }

    fn write_body(&self, out: &mut ChecksumOutput) {
        out.write_vint(Self::SERIALIZATION_FORMAT);
        out.write_string(&self.uid_field);
        out.write_string(&self.uid_text);
        out.write_i64(self.version);
        out.write_u8(self.version_type.id());
    }

    fn read_body(input: &mut ChecksumInput<'_>) -> TranslogResult<Self> {
        let format = input.read_vint()?;
        let uid_field = input.read_string()?;
        let uid_text = input.read_string()?;
        let mut op = Self::new(uid_field, uid_text);
        if format >= 1 {
            op.version = input.read_i64()?;
        }
        if format >= 2 {
            op.version_type = VersionType::from_id(input.read_u8()?)?;
        }
        Ok(op)
    }
}

/// Legacy delete-by-query. Replayed from old generations during recovery;
/// new callers never append one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteByQuery {
    pub source: Vec<u8>,
    pub filtering_aliases: Vec<String>,
    pub types: Vec<String>,
}

impl DeleteByQuery {
    const SERIALIZATION_FORMAT: u32 = 2;

    fn write_body(&self, out: &mut ChecksumOutput) {
        out.write_vint(Self::SERIALIZATION_FORMAT);
        out.write_bytes(&self.source);
        out.write_vint(self.types.len() as u32);
        for doc_type in &self.types {
            out.write_string(doc_type);
        }
        out.write_vint(self.filtering_aliases.len() as u32);
        for alias in &self.filtering_aliases {
            out.write_string(alias);
        }
    }

    fn read_body(input: &mut ChecksumInput<'_>) -> TranslogResult<Self> {
        let format = input.read_vint()?;
        let source = input.read_bytes()?;
        if format < 2 {
            // query parser name, long since removed
            if input.read_bool()? {
                input.read_string()?;
            }
        }
        let type_count = input.read_vint()? as usize;
        let mut types = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            types.push(input.read_string()?);
        }
        let mut filtering_aliases = Vec::new();
        if format >= 1 {
            let alias_count = input.read_vint()? as usize;
            for _ in 0..alias_count {
                filtering_aliases.push(input.read_string()?);
            }
        }
        Ok(Self {
            source,
            filtering_aliases,
            types,
        })
    }
}

/// A single translog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create(Create),
    Index(Index),
    Delete(Delete),
    DeleteByQuery(DeleteByQuery),
}

impl Operation {
    /// On-disk type tag.
    pub fn tag(&self) -> u8 {
        match self {
            Operation::Create(_) => 1,
            Operation::Index(_) => 2,
            Operation::Delete(_) => 3,
            Operation::DeleteByQuery(_) => 4,
        }
    }

    /// Rough in-memory footprint, used by engines for buffer accounting.
    pub fn estimate_size(&self) -> usize {
        match self {
            Operation::Create(op) => (op.id.len() + op.doc_type.len()) * 2 + op.source.len() + 12,
            Operation::Index(op) => (op.id.len() + op.doc_type.len()) * 2 + op.source.len() + 12,
            Operation::Delete(op) => (op.uid_field.len() + op.uid_text.len()) * 2 + 20,
            Operation::DeleteByQuery(op) => op.source.len() + 8,
        }
    }

    /// Document payload, when the operation carries one.
    pub fn source(&self) -> Option<Source<'_>> {
        match self {
            Operation::Create(op) => Some(Source {
                source: &op.source,
                routing: op.routing.as_deref(),
                parent: op.parent.as_deref(),
                timestamp: op.timestamp,
                ttl: op.ttl,
            }),
            Operation::Index(op) => Some(Source {
                source: &op.source,
                routing: op.routing.as_deref(),
                parent: op.parent.as_deref(),
                timestamp: op.timestamp,
                ttl: op.ttl,
            }),
            Operation::Delete(_) | Operation::DeleteByQuery(_) => None,
        }
    }

    fn write_body(&self, out: &mut ChecksumOutput) {
        match self {
            Operation::Create(op) => op.write_body(out),
            Operation::Index(op) => op.write_body(out),
            Operation::Delete(op) => op.write_body(out),
            Operation::DeleteByQuery(op) => op.write_body(out),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create(op) => {
                write!(f, "Create{{id='{}', type='{}'}}", op.id, op.doc_type)
            }
            Operation::Index(op) => {
                write!(f, "Index{{id='{}', type='{}'}}", op.id, op.doc_type)
            }
            Operation::Delete(op) => {
                write!(f, "Delete{{uid={}:{}}}", op.uid_field, op.uid_text)
            }
            Operation::DeleteByQuery(op) => {
                write!(f, "DeleteByQuery{{types={:?}}}", op.types)
            }
        }
    }
}

/// Encodes an operation into a complete record frame.
pub fn encode_operation(op: &Operation) -> Vec<u8> {
    let mut out = ChecksumOutput::new();
    out.write_u8(op.tag());
    op.write_body(&mut out);
    let checksum = out.checksum();
    let body = out.into_bytes();

    // size covers tag + body + trailing checksum, not the size field itself
    let size = (body.len() + 4) as i32;
    let mut frame = Vec::with_capacity(4 + body.len() + 4);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame
}

/// Decodes one record frame produced by [`encode_operation`] (or read back
/// from disk), verifying the trailing checksum.
pub fn decode_operation(frame: &[u8]) -> TranslogResult<Operation> {
    if frame.len() < 4 {
        return Err(TranslogError::Truncated(
            "record ends inside its size prefix".to_string(),
        ));
    }
    let size = i32::from_be_bytes(frame[..4].try_into().unwrap());
    // smallest possible record: tag byte + trailing checksum
    if size < 5 {
        return Err(TranslogError::Corrupted(format!(
            "invalid record size [{size}]"
        )));
    }
    let size = size as usize;
    if frame.len() < 4 + size {
        return Err(TranslogError::Truncated(format!(
            "record claims {} bytes but only {} remain",
            size,
            frame.len() - 4
        )));
    }

    let mut input = ChecksumInput::new(&frame[4..4 + size]);
    let tag = input.read_u8()?;
    let op = match tag {
        1 => Operation::Create(Create::read_body(&mut input)?),
        2 => Operation::Index(Index::read_body(&mut input)?),
        3 => Operation::Delete(Delete::read_body(&mut input)?),
        4 => Operation::DeleteByQuery(DeleteByQuery::read_body(&mut input)?),
        other => {
            return Err(TranslogError::Corrupted(format!(
                "no operation type mapped for tag [{other}]"
            )))
        }
    };

    // The expected value must be captured before consuming the stored one.
    let expected = input.checksum();
    let stored = input.read_stored_checksum()?;
    if expected != stored {
        return Err(TranslogError::Corrupted(format!(
            "checksum mismatch, expected: 0x{expected:x}, got: 0x{stored:x}"
        )));
    }
    Ok(op)
}
