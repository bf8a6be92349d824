//! Plain-text archive of completed transactions.
//!
//! One record per file, named
//! `yyyy-MM-dd-HH-mm-ss-<txId>-<txType>[-<n>].ecrtn.txt`, with sections
//! `[TransactionInfo]`, optional `[BonusInfo]` and `[ExtraInfo]`. A missing
//! value is the `null:` marker, an empty value is empty, a value the format
//! cannot carry verbatim is base64 with the `b64:` prefix. Receipts and
//! flags are always base64.

use crate::session::{BonusInfo, SessionKind};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ecrlink::packets::TransactionResult;
use std::collections::HashMap;
use std::path::PathBuf;

/// Hands completed results to an external archive, keyed by timestamp and
/// transaction id.
#[cfg_attr(test, mockall::automock)]
pub trait RecordStore: Send + Sync {
    fn store(&self, record: &TransactionRecord) -> Result<()>;
}

/// One archived transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub completed_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub kind: Option<SessionKind>,
    pub result: TransactionResult,
    pub bonus: Option<BonusInfo>,
}

/// A value survives verbatim only if it is printable ASCII without edge
/// whitespace and cannot be mistaken for a marker.
fn is_safe(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|b| (0x20..0x7f).contains(&b))
        && !value.starts_with(' ')
        && !value.ends_with(' ')
        && !value.starts_with("b64:")
        && !value.starts_with("null:")
}

fn encode_value(value: &str) -> String {
    if value.is_empty() || is_safe(value) {
        value.to_string()
    } else {
        format!("b64:{}", BASE64.encode(value.as_bytes()))
    }
}

fn encode_opt(value: Option<&str>) -> String {
    match value {
        None => "null:".to_string(),
        Some(value) => encode_value(value),
    }
}

fn encode_b64(value: &str) -> String {
    format!("b64:{}", BASE64.encode(value.as_bytes()))
}

fn decode_value(raw: &str) -> Result<Option<String>> {
    if raw == "null:" {
        return Ok(None);
    }
    if let Some(encoded) = raw.strip_prefix("b64:") {
        let bytes = BASE64
            .decode(encoded)
            .with_context(|| format!("bad base64 value {raw:?}"))?;
        return Ok(Some(String::from_utf8(bytes)?));
    }
    Ok(Some(raw.to_string()))
}

struct Section<'a>(&'a HashMap<String, String>);

impl Section<'_> {
    fn required(&self, key: &str) -> Result<String> {
        let raw = self
            .0
            .get(key)
            .ok_or_else(|| anyhow!("missing key {key}"))?;
        decode_value(raw)?.ok_or_else(|| anyhow!("key {key} must not be null"))
    }

    fn optional(&self, key: &str) -> Result<Option<String>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(raw) => decode_value(raw),
        }
    }

    fn character(&self, key: &str) -> Result<char> {
        let value = self.required(key)?;
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => bail!("key {key} is not a single character: {value:?}"),
        }
    }
}

impl TransactionRecord {
    /// The filename stem this record is archived under, without the dedup
    /// suffix and extension.
    pub fn file_stem(&self) -> String {
        format!(
            "{}-{}-{}",
            self.completed_at.format("%Y-%m-%d-%H-%M-%S"),
            self.result.transaction_id,
            self.result.transaction_type
        )
    }

    pub fn to_text(&self) -> String {
        let result = &self.result;
        let mut out = String::from("[TransactionInfo]\n");
        let kv = |out: &mut String, key: &str, value: String| {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        };
        kv(&mut out, "extended", result.extended.to_string());
        kv(
            &mut out,
            "transactionType",
            encode_value(&result.transaction_type.to_string()),
        );
        kv(
            &mut out,
            "paymentMethod",
            encode_value(&result.payment_method.to_string()),
        );
        kv(
            &mut out,
            "cardType",
            encode_value(&result.card_type.to_string()),
        );
        kv(
            &mut out,
            "transactionUsage",
            encode_value(&result.transaction_usage.to_string()),
        );
        kv(&mut out, "settlementId", encode_value(&result.settlement_id));
        kv(
            &mut out,
            "maskedCardNumber",
            encode_value(&result.masked_card_number),
        );
        kv(&mut out, "aid", encode_value(&result.aid));
        kv(
            &mut out,
            "transactionCertificate",
            encode_value(&result.transaction_certificate),
        );
        kv(&mut out, "tvr", encode_value(&result.tvr));
        kv(&mut out, "tsi", encode_value(&result.tsi));
        kv(
            &mut out,
            "transactionId",
            encode_value(&result.transaction_id),
        );
        kv(&mut out, "filingCode", encode_value(&result.filing_code));
        kv(&mut out, "timestamp", encode_value(&result.timestamp));
        kv(&mut out, "amount", result.amount.to_string());
        kv(&mut out, "currency", encode_value(&result.currency));
        kv(
            &mut out,
            "readerSerialNumber",
            encode_value(&result.reader_serial_number),
        );
        kv(
            &mut out,
            "printPayeeReceipt",
            result.print_payee_receipt.to_string(),
        );
        kv(&mut out, "flags", encode_b64(&result.flags));
        kv(&mut out, "payerReceipt", encode_b64(&result.payer_receipt));
        kv(&mut out, "payeeReceipt", encode_b64(&result.payee_receipt));

        if let Some(bonus) = &self.bonus {
            out.push_str("\n[BonusInfo]\n");
            kv(
                &mut out,
                "customerNumber",
                encode_value(&bonus.customer_number),
            );
            kv(&mut out, "memberClass", encode_value(&bonus.member_class));
            kv(&mut out, "statusCode", encode_value(&bonus.status_code));
            kv(&mut out, "statusText", encode_value(&bonus.status_text));
        }

        out.push_str("\n[ExtraInfo]\n");
        kv(
            &mut out,
            "sessionId",
            encode_opt(self.session_id.as_deref()),
        );
        kv(
            &mut out,
            "sessionKind",
            encode_opt(self.kind.map(SessionKind::command)),
        );
        kv(&mut out, "completedAt", self.completed_at.to_rfc3339());
        out
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed line: {line:?}"))?;
            sections
                .get_mut(&current)
                .ok_or_else(|| anyhow!("key {key} outside of any section"))?
                .insert(key.to_string(), value.to_string());
        }

        let tx = Section(
            sections
                .get("TransactionInfo")
                .ok_or_else(|| anyhow!("missing [TransactionInfo]"))?,
        );
        let result = TransactionResult {
            extended: tx.required("extended")?.parse()?,
            transaction_type: tx.character("transactionType")?,
            payment_method: tx.character("paymentMethod")?,
            card_type: tx.character("cardType")?,
            transaction_usage: tx.character("transactionUsage")?,
            settlement_id: tx.required("settlementId")?,
            masked_card_number: tx.required("maskedCardNumber")?,
            aid: tx.required("aid")?,
            transaction_certificate: tx.required("transactionCertificate")?,
            tvr: tx.required("tvr")?,
            tsi: tx.required("tsi")?,
            transaction_id: tx.required("transactionId")?,
            filing_code: tx.required("filingCode")?,
            timestamp: tx.required("timestamp")?,
            amount: tx.required("amount")?.parse()?,
            currency: tx.required("currency")?,
            reader_serial_number: tx.required("readerSerialNumber")?,
            print_payee_receipt: tx.required("printPayeeReceipt")?.parse()?,
            flags: tx.required("flags")?,
            payer_receipt: tx.required("payerReceipt")?,
            payee_receipt: tx.required("payeeReceipt")?,
        };

        let bonus = match sections.get("BonusInfo") {
            None => None,
            Some(map) => {
                let section = Section(map);
                Some(BonusInfo {
                    customer_number: section.required("customerNumber")?,
                    member_class: section.required("memberClass")?,
                    status_code: section.required("statusCode")?,
                    status_text: section.optional("statusText")?.unwrap_or_default(),
                })
            }
        };

        let extra = Section(
            sections
                .get("ExtraInfo")
                .ok_or_else(|| anyhow!("missing [ExtraInfo]"))?,
        );
        let kind = match extra.optional("sessionKind")?.as_deref() {
            None => None,
            Some("Payment") => Some(SessionKind::Payment),
            Some("Refund") => Some(SessionKind::Refund),
            Some("Reversal") => Some(SessionKind::Reversal),
            Some("Retrieve") => Some(SessionKind::Retrieve),
            Some(other) => bail!("unknown session kind {other:?}"),
        };
        let completed_at = DateTime::parse_from_rfc3339(&extra.required("completedAt")?)
            .context("bad completedAt")?
            .with_timezone(&Utc);

        Ok(Self {
            completed_at,
            session_id: extra.optional("sessionId")?,
            kind,
            result,
            bonus,
        })
    }
}

/// [RecordStore] writing one file per record below `dir`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RecordStore for FileStore {
    fn store(&self, record: &TransactionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {:?}", self.dir))?;
        let stem = record.file_stem();
        let mut n = 0;
        loop {
            let name = if n == 0 {
                format!("{stem}.ecrtn.txt")
            } else {
                format!("{stem}-{n}.ecrtn.txt")
            };
            let path = self.dir.join(name);
            if path.exists() {
                n += 1;
                continue;
            }
            std::fs::write(&path, record.to_text())
                .with_context(|| format!("writing {path:?}"))?;
            log::info!("archived transaction to {path:?}");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result() -> TransactionResult {
        TransactionResult {
            extended: false,
            transaction_type: '0',
            payment_method: '0',
            card_type: '1',
            transaction_usage: '0',
            settlement_id: "07".to_string(),
            masked_card_number: "541333**1234".to_string(),
            aid: "A0000000041010".to_string(),
            transaction_certificate: "1F03A2".to_string(),
            tvr: "0000048000".to_string(),
            tsi: "E800".to_string(),
            transaction_id: "00042".to_string(),
            filing_code: "000000000017".to_string(),
            timestamp: "240517134530".to_string(),
            amount: 1234,
            currency: "978".to_string(),
            reader_serial_number: "000012345".to_string(),
            print_payee_receipt: true,
            flags: "0".to_string(),
            payer_receipt: "LINE 1\nLINE 2\n".to_string(),
            payee_receipt: "MERCHANT COPY\n".to_string(),
        }
    }

    fn record() -> TransactionRecord {
        TransactionRecord {
            completed_at: Utc.with_ymd_and_hms(2024, 5, 17, 13, 45, 30).unwrap(),
            session_id: Some("000001".to_string()),
            kind: Some(SessionKind::Payment),
            result: result(),
            bonus: None,
        }
    }

    #[test]
    fn test_roundtrip_plain() {
        let record = record();
        let text = record.to_text();
        assert_eq!(TransactionRecord::from_text(&text).unwrap(), record);
    }

    #[test]
    fn test_roundtrip_extended_with_bonus() {
        let mut record = record();
        record.result.extended = true;
        record.session_id = None;
        record.kind = None;
        record.bonus = Some(BonusInfo {
            customer_number: "9912345678".to_string(),
            member_class: "02".to_string(),
            status_code: "2001".to_string(),
            status_text: String::new(),
        });
        let text = record.to_text();
        assert_eq!(TransactionRecord::from_text(&text).unwrap(), record);
    }

    #[test]
    fn test_roundtrip_hostile_values() {
        let mut record = record();
        // Values the verbatim form cannot carry.
        record.result.masked_card_number = "b64:not actually".to_string();
        record.result.aid = " leading space".to_string();
        record.result.settlement_id = "null:".to_string();
        record.result.currency = "line\nbreak".to_string();
        record.result.tvr = "euro \u{20ac}".to_string();
        record.result.tsi = String::new();
        let text = record.to_text();
        assert_eq!(TransactionRecord::from_text(&text).unwrap(), record);
    }

    #[test]
    fn test_receipts_are_byte_exact() {
        let record = record();
        let text = record.to_text();
        let parsed = TransactionRecord::from_text(&text).unwrap();
        assert_eq!(parsed.result.payer_receipt, "LINE 1\nLINE 2\n");
        assert_eq!(parsed.result.payee_receipt, "MERCHANT COPY\n");
        assert_eq!(parsed.result.flags, "0");
    }

    #[test]
    fn test_filename_scheme() {
        assert_eq!(record().file_stem(), "2024-05-17-13-45-30-00042-0");
    }

    #[test]
    fn test_file_store_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let record = record();
        store.store(&record).unwrap();
        store.store(&record).unwrap();
        store.store(&record).unwrap();
        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "2024-05-17-13-45-30-00042-0-1.ecrtn.txt",
                "2024-05-17-13-45-30-00042-0-2.ecrtn.txt",
                "2024-05-17-13-45-30-00042-0.ecrtn.txt",
            ]
        );
        let text = std::fs::read_to_string(dir.path().join(&names[2])).unwrap();
        assert_eq!(TransactionRecord::from_text(&text).unwrap(), record);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(TransactionRecord::from_text("").is_err());
        assert!(TransactionRecord::from_text("[TransactionInfo]\nnot a pair\n").is_err());
        let text = record().to_text().replace("amount=1234", "amount=soon");
        assert!(TransactionRecord::from_text(&text).is_err());
    }
}
