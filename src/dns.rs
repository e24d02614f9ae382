//! Minimal DNS wire format for the tunnel.
//!
//! Implements just enough of the DNS protocol to:
//! - build A-record queries whose QNAME carries tunnel payload
//! - build A-record answers whose rdata carries the ACK address
//! - answer anything outside the tunnel domain with NXDOMAIN
//! - frame messages for TCP transport (RFC 1035 two-byte length prefix)

use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const QTYPE_A: u16 = 1;
pub const QCLASS_IN: u16 = 1;

/// TTL on tunnel answers.
pub const ANSWER_TTL: u32 = 60;

const FLAGS_QUERY: u16 = 0x0100; // standard query, recursion desired
const FLAGS_RESPONSE: u16 = 0x8180; // response, no error
const FLAGS_NXDOMAIN: u16 = 0x8183; // response, name error

/// DNS message header (12 bytes).
#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAGS_QUERY,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn new_response(id: u16, ancount: u16) -> Self {
        Self {
            id,
            flags: FLAGS_RESPONSE,
            qdcount: 1,
            ancount,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn new_nxdomain(id: u16) -> Self {
        Self {
            id,
            flags: FLAGS_NXDOMAIN,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(TunnelError::Format("DNS header too short".into()));
        }
        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    pub fn is_response(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}

/// DNS question.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new_a(qname: &str) -> Self {
        Self {
            qname: qname.to_string(),
            qtype: QTYPE_A,
            qclass: QCLASS_IN,
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let qname = read_domain_name(buf)?;
        if buf.remaining() < 4 {
            return Err(TunnelError::Format("DNS question too short".into()));
        }
        Ok(Self {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        write_domain_name(&self.qname, buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }
}

/// DNS resource record (answer).
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn new_a(name: &str, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: QTYPE_A,
            rclass: QCLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_domain_name(buf)?;
        if buf.remaining() < 10 {
            return Err(TunnelError::Format("DNS record too short".into()));
        }
        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;
        if buf.remaining() < rdlen {
            return Err(TunnelError::Format("truncated DNS record data".into()));
        }
        let mut rdata = vec![0u8; rdlen];
        buf.copy_to_slice(&mut rdata);
        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        write_domain_name(&self.name, buf);
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.put_slice(&self.rdata);
    }

    /// IPv4 address carried by an A record.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != QTYPE_A || self.rdata.len() != 4 {
            return None;
        }
        Some(Ipv4Addr::new(
            self.rdata[0],
            self.rdata[1],
            self.rdata[2],
            self.rdata[3],
        ))
    }
}

/// DNS message (complete query or response).
#[derive(Debug)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsMessage {
    pub fn new_query(qname: &str, id: u16) -> Self {
        Self {
            header: DnsHeader::new_query(id),
            questions: vec![DnsQuestion::new_a(qname)],
            answers: Vec::new(),
        }
    }

    /// Response echoing the question with a single A answer.
    pub fn new_answer(qname: &str, addr: Ipv4Addr, id: u16) -> Self {
        Self {
            header: DnsHeader::new_response(id, 1),
            questions: vec![DnsQuestion::new_a(qname)],
            answers: vec![DnsRecord::new_a(qname, addr, ANSWER_TTL)],
        }
    }

    /// Empty NXDOMAIN response for queries outside the tunnel domain.
    pub fn new_nxdomain(qname: &str, id: u16) -> Self {
        Self {
            header: DnsHeader::new_nxdomain(id),
            questions: vec![DnsQuestion::new_a(qname)],
            answers: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::new();
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(&mut cursor)?);
        }

        let mut answers = Vec::new();
        for _ in 0..header.ancount {
            answers.push(DnsRecord::parse(&mut cursor)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        self.header.write(&mut buf);
        for question in &self.questions {
            question.write(&mut buf);
        }
        for answer in &self.answers {
            answer.write(&mut buf);
        }
        buf.to_vec()
    }

    pub fn question_name(&self) -> Result<&str> {
        self.questions
            .first()
            .map(|q| q.qname.as_str())
            .ok_or_else(|| TunnelError::Format("no question in DNS message".into()))
    }

    /// First A answer's address, if any.
    pub fn first_a_answer(&self) -> Option<Ipv4Addr> {
        self.answers.iter().find_map(DnsRecord::ipv4)
    }
}

/// Read a domain name from a DNS message. Compression pointers end the name;
/// the tunnel never emits them, so the payload labels are always inline.
fn read_domain_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels = Vec::new();
    let mut remaining_labels = 128; // loop guard

    loop {
        if remaining_labels == 0 {
            return Err(TunnelError::Format("too many labels in domain name".into()));
        }
        remaining_labels -= 1;

        if !buf.has_remaining() {
            return Err(TunnelError::Format("truncated domain name".into()));
        }
        let len = buf.get_u8();

        if len == 0 {
            break;
        }

        if (len & 0xc0) == 0xc0 {
            if buf.has_remaining() {
                buf.get_u8(); // second byte of the pointer
            }
            break;
        }

        let label_len = len as usize;
        if buf.remaining() < label_len {
            return Err(TunnelError::Format("truncated label".into()));
        }
        let mut label = vec![0u8; label_len];
        buf.copy_to_slice(&mut label);
        labels.push(
            String::from_utf8(label)
                .map_err(|_| TunnelError::Format("non-UTF-8 label in domain name".into()))?,
        );
    }

    Ok(labels.join("."))
}

/// Write a domain name in uncompressed wire form.
fn write_domain_name(domain: &str, buf: &mut BytesMut) {
    for label in domain.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        buf.put_u8(bytes.len() as u8);
        buf.put_slice(bytes);
    }
    buf.put_u8(0);
}

/// Read one length-prefixed DNS message from a TCP stream.
pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

/// Write one DNS message with the TCP length prefix.
pub async fn write_frame<S>(stream: &mut S, message: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await?;
    Ok(())
}
