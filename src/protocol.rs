//! MongoDB wire protocol message encoding and decoding.
//!
//! This module implements the two framing variants the server speaks:
//! the legacy OP_QUERY/OP_REPLY pair and the section-based OP_MSG format.
//! Reference: https://www.mongodb.com/docs/manual/reference/mongodb-wire-protocol/
//!
//! All integers on the wire are little-endian.

use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{MongoError, MongoResult};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest message the server will produce or accept.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Minimum wire version at which the server understands OP_MSG framing.
pub const OP_MSG_MIN_WIRE_VERSION: i32 = 6;

/// OP_MSG flag bits.
pub const FLAG_CHECKSUM_PRESENT: u32 = 1 << 0;
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;

/// Wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    Message = 2013,
}

impl OpCode {
    pub fn from_i32(value: i32) -> MongoResult<Self> {
        match value {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Message),
            other => Err(MongoError::Protocol(format!("Unknown opcode: {}", other))),
        }
    }
}

// ============================================================================
// Message Header
// ============================================================================

/// The 16-byte header prefixed to every wire message.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    /// Total message length, including this header.
    pub message_length: i32,
    pub request_id: i32,
    /// Request id this message answers. 0 for requests.
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    fn new(op_code: OpCode, request_id: i32) -> Self {
        Self {
            message_length: 0,
            request_id,
            response_to: 0,
            op_code,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code as i32);
    }

    pub fn read_from(buf: &mut Bytes) -> MongoResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(MongoError::Protocol(
                "Incomplete message header".to_string(),
            ));
        }

        Ok(Self {
            message_length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            op_code: OpCode::from_i32(buf.get_i32_le())?,
        })
    }
}

// ============================================================================
// Legacy framing: OP_QUERY / OP_REPLY
// ============================================================================

/// Legacy single-document command request.
#[derive(Debug, Clone)]
pub struct OpQuery {
    pub header: MessageHeader,
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    /// A command query: exactly one document, one expected reply document.
    pub fn new(query: Document, request_id: i32, full_collection_name: String) -> Self {
        Self {
            header: MessageHeader::new(OpCode::Query, request_id),
            flags: 0,
            full_collection_name,
            number_to_skip: 0,
            number_to_return: 1,
            query,
            return_fields_selector: None,
        }
    }

    pub fn encode(&self) -> MongoResult<BytesMut> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.flags);
        put_cstring(&mut body, &self.full_collection_name);
        body.put_i32_le(self.number_to_skip);
        body.put_i32_le(self.number_to_return);
        put_document(&mut body, &self.query)?;
        if let Some(selector) = &self.return_fields_selector {
            put_document(&mut body, selector)?;
        }

        Ok(frame(&self.header, body))
    }

    pub fn read_from(header: MessageHeader, mut body: Bytes) -> MongoResult<Self> {
        if body.remaining() < 4 {
            return Err(MongoError::Protocol("Incomplete OP_QUERY body".to_string()));
        }
        let flags = body.get_i32_le();
        let full_collection_name = read_cstring(&mut body)?;
        if body.remaining() < 8 {
            return Err(MongoError::Protocol("Incomplete OP_QUERY body".to_string()));
        }
        let number_to_skip = body.get_i32_le();
        let number_to_return = body.get_i32_le();
        let query = read_document(&mut body)?;
        let return_fields_selector = if body.has_remaining() {
            Some(read_document(&mut body)?)
        } else {
            None
        };

        Ok(Self {
            header,
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}

/// Legacy reply to an OP_QUERY.
#[derive(Debug, Clone)]
pub struct OpReply {
    pub header: MessageHeader,
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    pub fn new(documents: Vec<Document>, request_id: i32, response_to: i32) -> Self {
        let mut header = MessageHeader::new(OpCode::Reply, request_id);
        header.response_to = response_to;

        Self {
            header,
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents,
        }
    }

    pub fn encode(&self) -> MongoResult<BytesMut> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.flags);
        body.put_i64_le(self.cursor_id);
        body.put_i32_le(self.starting_from);
        body.put_i32_le(self.number_returned);
        for document in &self.documents {
            put_document(&mut body, document)?;
        }

        Ok(frame(&self.header, body))
    }

    pub fn read_from(header: MessageHeader, mut body: Bytes) -> MongoResult<Self> {
        if body.remaining() < 20 {
            return Err(MongoError::Protocol("Incomplete OP_REPLY body".to_string()));
        }
        let flags = body.get_i32_le();
        let cursor_id = body.get_i64_le();
        let starting_from = body.get_i32_le();
        let number_returned = body.get_i32_le();

        // The declared count is server-controlled; capacity is bounded by
        // what the frame actually carries.
        let mut documents = Vec::new();
        for _ in 0..number_returned {
            documents.push(read_document(&mut body)?);
        }

        Ok(Self {
            header,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }
}

// ============================================================================
// Modern framing: OP_MSG
// ============================================================================

/// A named batch of documents carried alongside the command body
/// (e.g. the documents of a bulk insert).
#[derive(Debug, Clone)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// One OP_MSG section: either a single body document (kind 0) or a named
/// document sequence (kind 1).
#[derive(Debug, Clone)]
pub enum MessageSection {
    Body(Document),
    Sequence(DocumentSequence),
}

/// Section-based command request or reply.
#[derive(Debug, Clone)]
pub struct OpMessage {
    pub header: MessageHeader,
    pub flags: u32,
    pub sections: SmallVec<[MessageSection; 2]>,
}

impl OpMessage {
    pub fn new(body: Document, request_id: i32) -> Self {
        Self::with_sequences(body, Vec::new(), request_id)
    }

    pub fn with_sequences(
        body: Document,
        sequences: Vec<DocumentSequence>,
        request_id: i32,
    ) -> Self {
        let mut sections = SmallVec::new();
        sections.push(MessageSection::Body(body));
        sections.extend(sequences.into_iter().map(MessageSection::Sequence));

        Self {
            header: MessageHeader::new(OpCode::Message, request_id),
            flags: 0,
            sections,
        }
    }

    /// The first body section, which always carries the command document.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|section| match section {
            MessageSection::Body(document) => Some(document),
            MessageSection::Sequence(_) => None,
        })
    }

    pub fn encode(&self) -> MongoResult<BytesMut> {
        let mut body = BytesMut::new();
        // The checksum bit is never set on outgoing messages.
        body.put_u32_le(self.flags & !FLAG_CHECKSUM_PRESENT);

        for section in &self.sections {
            match section {
                MessageSection::Body(document) => {
                    body.put_u8(0);
                    put_document(&mut body, document)?;
                }
                MessageSection::Sequence(sequence) => {
                    body.put_u8(1);

                    let mut payload = BytesMut::new();
                    put_cstring(&mut payload, &sequence.identifier);
                    for document in &sequence.documents {
                        put_document(&mut payload, document)?;
                    }

                    // Section size includes the size field itself.
                    body.put_i32_le(payload.len() as i32 + 4);
                    body.put_slice(&payload);
                }
            }
        }

        Ok(frame(&self.header, body))
    }

    pub fn read_from(header: MessageHeader, mut body: Bytes) -> MongoResult<Self> {
        if body.remaining() < 4 {
            return Err(MongoError::Protocol("Incomplete OP_MSG flags".to_string()));
        }
        let flags = body.get_u32_le();

        // A trailing CRC-32C is skipped, not validated.
        let mut content = if flags & FLAG_CHECKSUM_PRESENT != 0 {
            if body.remaining() < 4 {
                return Err(MongoError::Protocol("Missing OP_MSG checksum".to_string()));
            }
            body.split_to(body.remaining() - 4)
        } else {
            body
        };

        let mut sections = SmallVec::new();
        while content.has_remaining() {
            match content.get_u8() {
                0 => sections.push(MessageSection::Body(read_document(&mut content)?)),
                1 => {
                    if content.remaining() < 4 {
                        return Err(MongoError::Protocol(
                            "Incomplete OP_MSG section header".to_string(),
                        ));
                    }
                    let size = content.get_i32_le() as usize;
                    if size < 4 || size - 4 > content.remaining() {
                        return Err(MongoError::Protocol(
                            "Invalid OP_MSG section size".to_string(),
                        ));
                    }

                    let mut payload = content.split_to(size - 4);
                    let identifier = read_cstring(&mut payload)?;
                    let mut documents = Vec::new();
                    while payload.has_remaining() {
                        documents.push(read_document(&mut payload)?);
                    }

                    sections.push(MessageSection::Sequence(DocumentSequence {
                        identifier,
                        documents,
                    }));
                }
                kind => {
                    return Err(MongoError::Protocol(format!(
                        "Unknown OP_MSG section kind: {}",
                        kind
                    )));
                }
            }
        }

        Ok(Self {
            header,
            flags,
            sections,
        })
    }
}

// ============================================================================
// Request / Reply unions
// ============================================================================

/// A framed outgoing command, tagged by wire format.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Query(OpQuery),
    Message(OpMessage),
}

impl ClientRequest {
    pub fn request_id(&self) -> i32 {
        match self {
            ClientRequest::Query(query) => query.header.request_id,
            ClientRequest::Message(message) => message.header.request_id,
        }
    }

    pub fn set_request_id(&mut self, request_id: i32) {
        match self {
            ClientRequest::Query(query) => query.header.request_id = request_id,
            ClientRequest::Message(message) => message.header.request_id = request_id,
        }
    }

    /// All documents of the request: body sections first, then sequence
    /// sections flattened in arrival order.
    pub fn documents(&self) -> Vec<&Document> {
        match self {
            ClientRequest::Query(query) => vec![&query.query],
            ClientRequest::Message(message) => collect_documents(&message.sections),
        }
    }

    pub fn encode(&self) -> MongoResult<BytesMut> {
        match self {
            ClientRequest::Query(query) => query.encode(),
            ClientRequest::Message(message) => message.encode(),
        }
    }

    /// Decodes a full frame, header included.
    pub fn decode(mut frame: Bytes) -> MongoResult<Self> {
        let header = MessageHeader::read_from(&mut frame)?;
        match header.op_code {
            OpCode::Query => Ok(ClientRequest::Query(OpQuery::read_from(header, frame)?)),
            OpCode::Message => Ok(ClientRequest::Message(OpMessage::read_from(header, frame)?)),
            OpCode::Reply => Err(MongoError::Protocol(
                "OP_REPLY is not a valid request".to_string(),
            )),
        }
    }
}

/// A correlated incoming reply, tagged by wire format.
///
/// The tag must match the framing that was sent; callers treat a mismatch
/// as a protocol failure, never as a silent fallback.
#[derive(Debug, Clone)]
pub enum ServerReply {
    Reply(OpReply),
    Message(OpMessage),
}

impl ServerReply {
    pub fn response_to(&self) -> i32 {
        match self {
            ServerReply::Reply(reply) => reply.header.response_to,
            ServerReply::Message(message) => message.header.response_to,
        }
    }

    /// All documents of the reply: body sections first, then sequence
    /// sections flattened in arrival order.
    pub fn documents(&self) -> Vec<&Document> {
        match self {
            ServerReply::Reply(reply) => reply.documents.iter().collect(),
            ServerReply::Message(message) => collect_documents(&message.sections),
        }
    }

    /// The first document, which carries the command outcome.
    pub fn body(&self) -> MongoResult<&Document> {
        self.documents()
            .first()
            .copied()
            .ok_or_else(|| MongoError::Protocol("Reply carries no documents".to_string()))
    }

    /// Maps the reply body onto a typed value through the document codec.
    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> MongoResult<T> {
        Ok(bson::from_document(self.body()?.clone())?)
    }

    pub fn encode(&self) -> MongoResult<BytesMut> {
        match self {
            ServerReply::Reply(reply) => reply.encode(),
            ServerReply::Message(message) => message.encode(),
        }
    }

    /// Decodes the body of a frame whose header was already read.
    pub fn read_from(header: MessageHeader, body: Bytes) -> MongoResult<Self> {
        match header.op_code {
            OpCode::Reply => Ok(ServerReply::Reply(OpReply::read_from(header, body)?)),
            OpCode::Message => Ok(ServerReply::Message(OpMessage::read_from(header, body)?)),
            OpCode::Query => Err(MongoError::Protocol(
                "OP_QUERY is not a valid reply".to_string(),
            )),
        }
    }

    /// Decodes a full frame, header included.
    pub fn decode(mut frame: Bytes) -> MongoResult<Self> {
        let header = MessageHeader::read_from(&mut frame)?;
        Self::read_from(header, frame)
    }
}

fn collect_documents(sections: &[MessageSection]) -> Vec<&Document> {
    let mut documents = Vec::new();
    for section in sections {
        if let MessageSection::Body(document) = section {
            documents.push(document);
        }
    }
    for section in sections {
        if let MessageSection::Sequence(sequence) = section {
            documents.extend(sequence.documents.iter());
        }
    }

    documents
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Prefix a finished body with its header, filling in the total length.
fn frame(header: &MessageHeader, body: BytesMut) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    let mut header = *header;
    header.message_length = (HEADER_SIZE + body.len()) as i32;
    header.write_to(&mut buf);
    buf.put_slice(&body);
    buf
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_document(buf: &mut BytesMut, document: &Document) -> MongoResult<()> {
    document.to_writer(buf.writer())?;
    Ok(())
}

fn read_document(buf: &mut Bytes) -> MongoResult<Document> {
    Ok(Document::from_reader(buf.reader())?)
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> MongoResult<String> {
    let mut end = 0;
    while end < buf.remaining() && buf[end] != 0 {
        end += 1;
    }

    if end >= buf.remaining() {
        return Err(MongoError::Protocol(
            "Missing null terminator in string".to_string(),
        ));
    }

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .map_err(|_| MongoError::Protocol("Invalid UTF-8 in string".to_string()))?;

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}
