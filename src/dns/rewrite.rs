use std::fmt;

use super::AnswerTable;

pub const HEADER_LEN: usize = 12;

const FLAGS_OFFSET: usize = 2;
const QDCOUNT_OFFSET: usize = 4;
const ANCOUNT_OFFSET: usize = 6;

/// Bits echoed back from the query: opcode, AA/TC and RD.
pub const ECHOED_FLAGS_MASK: u16 = 0b0111_1001_0000_0000;
pub const QR_FLAG: u16 = 0b1000_0000_0000_0000;

const POINTER_TAG: u16 = 0b11 << 14;
const MAX_POINTER_OFFSET: usize = 0x3FFF;
const MAX_LABEL_LEN: u8 = 63;

/// Reasons a query cannot be turned into a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    TruncatedHeader { len: usize },
    TruncatedQuestion { index: u16, offset: usize },
    UnsupportedLabel { offset: usize, byte: u8 },
    PointerOutOfRange { offset: usize },
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::TruncatedHeader { len } => {
                write!(f, "message of {len} bytes is shorter than the DNS header")
            }
            RewriteError::TruncatedQuestion { index, offset } => {
                write!(f, "question {index} runs past the end of the message at offset {offset}")
            }
            RewriteError::UnsupportedLabel { offset, byte } => {
                write!(f, "unsupported label length {byte:#04x} at offset {offset}")
            }
            RewriteError::PointerOutOfRange { offset } => {
                write!(f, "question name at offset {offset} cannot be addressed by a compression pointer")
            }
        }
    }
}

impl std::error::Error for RewriteError {}

/// Turn a DNS query into a response carrying synthetic answers.
///
/// The question section is copied verbatim, one answer is appended for every
/// question the table knows (its NAME is a compression pointer back to the
/// question), and whatever followed the questions in the query is passed
/// through after the answers. Compressed names in the question section are
/// rejected rather than followed.
pub fn rewrite_query(query: &[u8], table: &AnswerTable) -> Result<Vec<u8>, RewriteError> {
    if query.len() < HEADER_LEN {
        return Err(RewriteError::TruncatedHeader { len: query.len() });
    }

    let questions = read_u16(query, QDCOUNT_OFFSET).ok_or(RewriteError::TruncatedHeader {
        len: query.len(),
    })?;

    let mut answers = Vec::new();
    let mut answer_count: u16 = 0;
    let mut read_offset = HEADER_LEN;

    for index in 0..questions {
        let name_offset = read_offset;
        read_offset = skip_name(query, read_offset, index)?;

        let qtype = read_u16(query, read_offset).ok_or(RewriteError::TruncatedQuestion {
            index,
            offset: read_offset,
        })?;
        // QTYPE + QCLASS
        read_offset += 4;
        if read_offset > query.len() {
            return Err(RewriteError::TruncatedQuestion {
                index,
                offset: read_offset,
            });
        }

        let Some(record) = table.record_for(qtype) else {
            continue;
        };

        answers.extend_from_slice(&name_pointer(name_offset)?.to_be_bytes());
        answers.extend_from_slice(record);
        answer_count = answer_count.saturating_add(1);
    }

    let mut response = Vec::with_capacity(query.len() + answers.len());
    response.extend_from_slice(&query[..read_offset]);
    response.extend_from_slice(&answers);
    response.extend_from_slice(&query[read_offset..]);

    let flags = read_u16(&response, FLAGS_OFFSET).unwrap_or_default();
    write_u16(&mut response, FLAGS_OFFSET, response_flags(flags));
    write_u16(&mut response, ANCOUNT_OFFSET, answer_count);

    Ok(response)
}

/// Keep the echoed query bits and mark the message as a response.
pub fn response_flags(flags: u16) -> u16 {
    (flags & ECHOED_FLAGS_MASK) | QR_FLAG
}

fn skip_name(message: &[u8], mut offset: usize, index: u16) -> Result<usize, RewriteError> {
    loop {
        let len = *message
            .get(offset)
            .ok_or(RewriteError::TruncatedQuestion { index, offset })?;
        if len > MAX_LABEL_LEN {
            return Err(RewriteError::UnsupportedLabel { offset, byte: len });
        }
        offset += usize::from(len) + 1;
        if len == 0 {
            return Ok(offset);
        }
    }
}

fn name_pointer(offset: usize) -> Result<u16, RewriteError> {
    if offset > MAX_POINTER_OFFSET {
        return Err(RewriteError::PointerOutOfRange { offset });
    }
    Ok(offset as u16 | POINTER_TAG)
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType};
    use hickory_proto::rr::{RData, RecordType};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    /// Build a query with uncompressed question names, RD set.
    fn query_bytes(questions: &[(&str, RecordType)]) -> Vec<u8> {
        let mut message = vec![0xBE, 0xEF, 0x01, 0x00];
        message.extend_from_slice(&(questions.len() as u16).to_be_bytes());
        message.extend_from_slice(&[0; 6]);
        for (name, record_type) in questions {
            for label in name.trim_end_matches('.').split('.') {
                message.push(label.len() as u8);
                message.extend_from_slice(label.as_bytes());
            }
            message.push(0);
            message.extend_from_slice(&u16::from(*record_type).to_be_bytes());
            message.extend_from_slice(&1u16.to_be_bytes());
        }
        message
    }

    /// Offsets of each question's name in an uncompressed message.
    fn question_offsets(message: &[u8], count: usize) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut offset = HEADER_LEN;
        for _ in 0..count {
            offsets.push(offset);
            while message[offset] != 0 {
                offset += usize::from(message[offset]) + 1;
            }
            offset += 5;
        }
        offsets
    }

    #[test]
    fn single_a_question_gets_fixed_ipv4_answer() {
        let query = query_bytes(&[("tickets.example.com.", RecordType::A)]);
        let response = rewrite_query(&query, &AnswerTable::default()).expect("rewrite");

        let parsed = Message::from_vec(&response).expect("parse response");
        assert_eq!(parsed.id(), 0xBEEF);
        assert_eq!(parsed.message_type(), MessageType::Response);
        assert!(parsed.recursion_desired());
        assert_eq!(parsed.answers().len(), 1);

        let answer = &parsed.answers()[0];
        assert_eq!(answer.record_type(), RecordType::A);
        assert_eq!(answer.ttl(), 3600);
        assert_eq!(answer.name().to_ascii(), "tickets.example.com.");
        match answer.data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(63, 33, 92, 165)),
            other => panic!("unexpected rdata {other:?}"),
        }

        // pointer, type, class, ttl, rdlength, rdata
        let tail = &response[response.len() - 16..];
        assert_eq!(&tail[..2], &[0xC0, 12]);
        assert_eq!(&tail[2..4], &[0, 1]);
        assert_eq!(&tail[4..6], &[0, 1]);
        assert_eq!(&tail[6..10], &3600u32.to_be_bytes());
        assert_eq!(&tail[10..12], &[0, 4]);
        assert_eq!(&tail[12..], &[63, 33, 92, 165]);
    }

    #[test]
    fn answer_count_tracks_supported_types_only() {
        let questions = [
            ("a.example.", RecordType::A),
            ("mx.example.", RecordType::MX),
            ("v6.example.", RecordType::AAAA),
            ("txt.example.", RecordType::TXT),
            ("b.example.", RecordType::A),
        ];
        let query = query_bytes(&questions);
        let response = rewrite_query(&query, &AnswerTable::default()).expect("rewrite");

        assert_eq!(read_u16(&response, ANCOUNT_OFFSET), Some(3));

        let parsed = Message::from_vec(&response).expect("parse response");
        let names: Vec<_> = parsed
            .answers()
            .iter()
            .map(|record| (record.name().to_ascii(), record.record_type()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.example.".to_string(), RecordType::A),
                ("v6.example.".to_string(), RecordType::AAAA),
                ("b.example.".to_string(), RecordType::A),
            ]
        );
        match parsed.answers()[1].data() {
            RData::AAAA(aaaa) => assert_eq!(
                aaaa.0,
                Ipv6Addr::from_str("2a05:d018:1872:980b:10f6:71e8:7cc:ad2e").expect("ipv6")
            ),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[test]
    fn answer_pointers_reference_matching_question_names() {
        let questions = [
            ("first.example.", RecordType::AAAA),
            ("skipped.example.", RecordType::NS),
            ("third.example.org.", RecordType::A),
        ];
        let query = query_bytes(&questions);
        let response = rewrite_query(&query, &AnswerTable::default()).expect("rewrite");
        let offsets = question_offsets(&response, questions.len());

        let answers_start = query.len();
        let first = read_u16(&response, answers_start).expect("first pointer");
        assert_eq!(first & 0xC000, 0xC000);
        assert_eq!(usize::from(first & 0x3FFF), offsets[0]);

        // AAAA record: 2 pointer + 10 fixed + 16 rdata
        let second = read_u16(&response, answers_start + 28).expect("second pointer");
        assert_eq!(usize::from(second & 0x3FFF), offsets[2]);
    }

    #[test]
    fn zero_questions_only_rewrites_header() {
        let query = query_bytes(&[]);
        let response = rewrite_query(&query, &AnswerTable::default()).expect("rewrite");

        assert_eq!(response.len(), query.len());
        assert_eq!(read_u16(&response, ANCOUNT_OFFSET), Some(0));
        assert_eq!(&response[..2], &query[..2]);
        assert_eq!(&response[4..], &query[4..]);
        assert_eq!(
            read_u16(&response, FLAGS_OFFSET),
            Some(response_flags(read_u16(&query, FLAGS_OFFSET).unwrap_or_default()))
        );
    }

    #[test]
    fn trailing_sections_follow_the_answers() {
        let mut query = query_bytes(&[("example.com.", RecordType::A)]);
        let question_end = query.len();
        let additional = [0u8, 0, 41, 16, 0, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(&additional);
        query[11] = 1;

        let response = rewrite_query(&query, &AnswerTable::default()).expect("rewrite");
        assert_eq!(&response[..2], &query[..2]);
        assert_eq!(&response[12..question_end], &query[12..question_end]);
        assert_eq!(&response[question_end..question_end + 2], &[0xC0, 12]);
        assert_eq!(&response[response.len() - additional.len()..], &additional);

        let parsed = Message::from_vec(&response).expect("parse response");
        assert_eq!(parsed.answers().len(), 1);
        assert!(parsed.extensions().is_some());
    }

    #[test]
    fn response_flags_are_idempotent() {
        for flags in [0u16, 0x0100, 0x0120, 0xFFFF, 0x7900, 0x8180, 0x2A5A] {
            let once = response_flags(flags);
            assert_eq!(response_flags(once), once);
            assert_ne!(once & QR_FLAG, 0);
        }
        assert_eq!(response_flags(0x0120), 0x8100);
    }

    #[test]
    fn malformed_queries_are_rejected() {
        let table = AnswerTable::default();
        assert_eq!(
            rewrite_query(&[], &table),
            Err(RewriteError::TruncatedHeader { len: 0 })
        );
        assert_eq!(
            rewrite_query(&[0u8; 7], &table),
            Err(RewriteError::TruncatedHeader { len: 7 })
        );

        let mut claims_question = vec![0u8; HEADER_LEN];
        claims_question[5] = 1;
        assert!(matches!(
            rewrite_query(&claims_question, &table),
            Err(RewriteError::TruncatedQuestion { index: 0, .. })
        ));

        let mut label_overrun = claims_question.clone();
        label_overrun.extend_from_slice(&[7, b'e', b'x']);
        assert!(matches!(
            rewrite_query(&label_overrun, &table),
            Err(RewriteError::TruncatedQuestion { .. })
        ));

        let mut missing_class = claims_question.clone();
        missing_class.extend_from_slice(&[1, b'a', 0, 0, 1]);
        assert!(matches!(
            rewrite_query(&missing_class, &table),
            Err(RewriteError::TruncatedQuestion { .. })
        ));

        let mut compressed = claims_question;
        compressed.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1]);
        assert_eq!(
            rewrite_query(&compressed, &table),
            Err(RewriteError::UnsupportedLabel {
                offset: 12,
                byte: 0xC0
            })
        );
    }

    #[test]
    fn custom_table_changes_rdata() {
        let table = AnswerTable::new(
            Ipv4Addr::new(192, 0, 2, 7),
            Ipv6Addr::LOCALHOST,
            60,
        );
        let query = query_bytes(&[("example.net.", RecordType::A)]);
        let response = rewrite_query(&query, &table).expect("rewrite");
        let parsed = Message::from_vec(&response).expect("parse response");
        let answer = &parsed.answers()[0];
        assert_eq!(answer.ttl(), 60);
        match answer.data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(192, 0, 2, 7)),
            other => panic!("unexpected rdata {other:?}"),
        }
    }
}
