use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use serde::{Deserialize, Serialize};

/// 严格解码一个 DNS 报文 / strict decode of one wire-format message.
/// Short buffers, truncated name pointers and malformed records all fail.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtoError> {
    Message::from_bytes(bytes)
}

/// Canonical re-encode. Round-trips with [`decode`] for well-formed messages.
/// Upstream replies are never re-encoded on the forwarding path; this exists
/// for building outbound queries and for tests.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtoError> {
    message.to_bytes()
}

/// Only the first question is consulted; multi-question messages are
/// forwarded unchanged.
pub fn first_question(message: &Message) -> Option<&Query> {
    message.queries().first()
}

/// Per-answer loggable projection. Derived at journaling time, never sent on
/// the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedAnswer {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub ttl: u32,
    pub data: String,
}

/// 将应答记录渲染为可入库的文本形式 / render the answer section into a
/// journal-friendly form. Unknown record types yield a fixed marker instead
/// of failing the whole response.
pub fn render_answers(message: &Message) -> Vec<RenderedAnswer> {
    message
        .answers()
        .iter()
        .map(|record| {
            let data = match record.data() {
                Some(RData::A(a)) => a.0.to_string(),
                Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
                Some(RData::CNAME(cname)) => cname.0.to_string(),
                Some(RData::NS(ns)) => ns.0.to_string(),
                Some(RData::PTR(ptr)) => ptr.0.to_string(),
                Some(RData::MX(mx)) => format!("{} {}", mx.preference(), mx.exchange()),
                Some(RData::TXT(txt)) => txt
                    .txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => "unsupported record type".to_string(),
            };
            RenderedAnswer {
                name: record.name().to_string(),
                record_type: record.record_type().to_string(),
                ttl: record.ttl(),
                data,
            }
        })
        .collect()
}
