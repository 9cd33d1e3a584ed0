//! Table decoding: archive extraction, character decoding, schema validation and checksumming.

use std::io::{Cursor, Read};
use std::str::FromStr;

use csv::{ByteRecord, StringRecord};
use nomina_core::{Period, RawRow};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceEncoding {
    #[default]
    Latin1,
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("unknown source encoding {0:?}")]
    Unknown(String),
    #[error("bytes are not valid utf-8")]
    InvalidUtf8,
    #[error("character {0:?} cannot be represented in iso-8859-1")]
    Unrepresentable(char),
}

impl SourceEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String, EncodingError> {
        match self {
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(ToString::to_string)
                .map_err(|_| EncodingError::InvalidUtf8),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| EncodingError::Unrepresentable(c)))
                .collect(),
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }
}

impl FromStr for SourceEncoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            other => Err(EncodingError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reading table: {0}")]
    Csv(#[from] csv::Error),
    #[error("decoding table header: {0}")]
    Header(EncodingError),
    #[error("opening archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("reading archive entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive for {period} holds no table file")]
    MissingTable { period: Period },
}

/// Why a single record was left out of the decoded table.
#[derive(Debug, Error)]
pub enum RowRejection {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("schema mismatch: {0}")]
    Schema(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTable {
    pub rows: Vec<RawRow>,
    /// Every record read, rejected ones included.
    pub row_count: u64,
    pub rejected: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordDecoder {
    encoding: SourceEncoding,
}

impl RecordDecoder {
    pub fn new(encoding: SourceEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> SourceEncoding {
        self.encoding
    }

    /// Decodes a header-bearing table into raw rows.
    ///
    /// The checksum is an MD5 over every record's decoded values joined by `,`
    /// and re-encoded with the source encoding, accumulated row by row.
    pub fn decode<R: Read>(&self, reader: R) -> Result<DecodedTable, DecodeError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers = self
            .decode_fields(&csv_reader.byte_headers()?.clone())
            .map_err(DecodeError::Header)?;

        let mut digest = md5::Context::new();
        let mut rows = Vec::new();
        let mut row_count = 0u64;
        let mut rejected = 0u64;
        let mut record = ByteRecord::new();

        while csv_reader.read_byte_record(&mut record)? {
            row_count += 1;
            match self.decode_row(&headers, &record, &mut digest) {
                Ok(row) => rows.push(row),
                Err(rejection) => {
                    rejected += 1;
                    let line = record.position().map(|p| p.line()).unwrap_or(row_count + 1);
                    error!(line, %rejection, "dropping row that does not match the payroll schema");
                }
            }
        }

        let checksum = format!("{:x}", digest.compute());
        debug!(row_count, rejected, %checksum, "decoded payroll table");
        Ok(DecodedTable {
            rows,
            row_count,
            rejected,
            checksum,
        })
    }

    fn decode_fields(&self, record: &ByteRecord) -> Result<StringRecord, EncodingError> {
        let fields = record
            .iter()
            .map(|field| self.encoding.decode(field))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StringRecord::from(fields))
    }

    fn decode_row(
        &self,
        headers: &StringRecord,
        record: &ByteRecord,
        digest: &mut md5::Context,
    ) -> Result<RawRow, RowRejection> {
        let fields = match self.decode_fields(record) {
            Ok(fields) => fields,
            Err(err) => {
                // Undecodable rows still count towards the checksum, as raw bytes.
                digest.consume(record.iter().collect::<Vec<_>>().join(&b","[..]));
                return Err(err.into());
            }
        };
        let joined = fields.iter().collect::<Vec<_>>().join(",");
        digest.consume(self.encoding.encode(&joined)?);

        if fields.len() != headers.len() {
            return Err(RowRejection::FieldCount {
                expected: headers.len(),
                found: fields.len(),
            });
        }
        Ok(fields.deserialize(Some(headers))?)
    }
}

/// Upper bound on the buffer reserved from an entry's declared size.
const PREALLOCATION_LIMIT: usize = 64 * 1024 * 1024;

fn preallocation(declared: u64) -> usize {
    usize::try_from(declared)
        .unwrap_or(usize::MAX)
        .min(PREALLOCATION_LIMIT)
}

/// Pulls the period's table out of its zip archive.
///
/// Falls back to the only `.csv` entry when the archive does not use the
/// conventional `nomina_{period}.csv` name.
pub fn extract_period_table(archive_bytes: &[u8], period: &Period) -> Result<Vec<u8>, DecodeError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))?;
    let expected = period.table_file_name();

    let name = if archive.file_names().any(|n| n == expected) {
        expected
    } else {
        let candidates = archive
            .file_names()
            .filter(|n| n.to_ascii_lowercase().ends_with(".csv"))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        match candidates.as_slice() {
            [only] => only.clone(),
            _ => return Err(DecodeError::MissingTable { period: *period }),
        }
    };

    let mut entry = archive.by_name(&name)?;
    let mut bytes = Vec::with_capacity(preallocation(entry.size()));
    entry.read_to_end(&mut bytes)?;
    debug!(%period, entry = %name, bytes = bytes.len(), "extracted period table");
    Ok(bytes)
}

/// Extracts and decodes one period archive.
pub fn decode_period_archive(
    archive_bytes: &[u8],
    period: &Period,
    decoder: &RecordDecoder,
) -> Result<DecodedTable, DecodeError> {
    let table = extract_period_table(archive_bytes, period)?;
    decoder.decode(table.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nomina_core::RAW_COLUMNS;
    use std::io::Write;

    fn header() -> String {
        RAW_COLUMNS.join(",")
    }

    fn row(codigo_persona: &str, nombres: &str) -> String {
        RAW_COLUMNS
            .iter()
            .map(|column| match *column {
                "codigoPersona" => codigo_persona.to_string(),
                "nombres" => nombres.to_string(),
                "anio" => "2017".to_string(),
                "mes" => "5".to_string(),
                other => format!("v_{other}"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn latin1(text: &str) -> Vec<u8> {
        SourceEncoding::Latin1.encode(text).expect("latin1 text")
    }

    #[test]
    fn parses_encoding_names() {
        assert_eq!("ISO-8859-1".parse::<SourceEncoding>().unwrap(), SourceEncoding::Latin1);
        assert_eq!("utf8".parse::<SourceEncoding>().unwrap(), SourceEncoding::Utf8);
        assert!("ebcdic".parse::<SourceEncoding>().is_err());
    }

    #[test]
    fn latin1_round_trips_accented_text() {
        let bytes = vec![b'M', b'A', b'R', 0xCD, b'A'];
        let text = SourceEncoding::Latin1.decode(&bytes).unwrap();
        assert_eq!(text, "MARÍA");
        assert_eq!(SourceEncoding::Latin1.encode(&text).unwrap(), bytes);
        assert!(SourceEncoding::Latin1.encode("€").is_err());
    }

    #[test]
    fn decodes_rows_from_latin1_table() {
        let text = format!("{}\n{}\n{}\n", header(), row("1", "MARÍA"), row("2", "JOSÉ"));
        let table = RecordDecoder::new(SourceEncoding::Latin1)
            .decode(latin1(&text).as_slice())
            .expect("decode");
        assert_eq!(table.row_count, 2);
        assert_eq!(table.rejected, 0);
        assert_eq!(table.rows[0].nombres, "MARÍA");
        assert_eq!(table.rows[1].codigo_persona, "2");
        assert_eq!(table.rows[1].horas_catedra, "v_horasCatedra");
    }

    #[test]
    fn checksum_accumulates_joined_row_values() {
        let first = row("1", "MARÍA");
        let second = row("2", "ANA");
        let text = format!("{}\n{}\n{}\n", header(), first, second);

        let mut expected = md5::Context::new();
        expected.consume(latin1(&first));
        expected.consume(latin1(&second));
        let expected = format!("{:x}", expected.compute());

        let decoder = RecordDecoder::new(SourceEncoding::Latin1);
        let table = decoder.decode(latin1(&text).as_slice()).expect("decode");
        assert_eq!(table.checksum, expected);

        let again = decoder.decode(latin1(&text).as_slice()).expect("decode again");
        assert_eq!(again.checksum, table.checksum);
    }

    #[test]
    fn checksum_ignores_csv_quoting() {
        let plain = format!("{}\n{}\n", header(), row("1", "ANA"));
        let quoted = format!("{}\n{}\n", header(), row("1", "\"ANA\""));
        let decoder = RecordDecoder::default();
        let a = decoder.decode(plain.as_bytes()).expect("plain");
        let b = decoder.decode(quoted.as_bytes()).expect("quoted");
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(b.rows[0].nombres, "ANA");
    }

    #[test]
    fn short_rows_are_rejected_but_counted() {
        let text = format!("{}\n{}\nonly,three,fields\n{}\n", header(), row("1", "A"), row("2", "B"));
        let table = RecordDecoder::new(SourceEncoding::Utf8)
            .decode(text.as_bytes())
            .expect("decode");
        assert_eq!(table.row_count, 3);
        assert_eq!(table.rejected, 1);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].codigo_persona, "2");
    }

    #[test]
    fn invalid_utf8_row_is_rejected() {
        let mut bytes = format!("{}\n{}\n", header(), row("1", "A")).into_bytes();
        bytes.extend(latin1(&row("2", "JOSÉ")));
        bytes.push(b'\n');
        let table = RecordDecoder::new(SourceEncoding::Utf8)
            .decode(bytes.as_slice())
            .expect("decode");
        assert_eq!(table.row_count, 2);
        assert_eq!(table.rejected, 1);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn undecodable_rows_still_change_the_checksum() {
        let good = format!("{}\n{}\n", header(), row("1", "A")).into_bytes();
        let mut with_bad = good.clone();
        with_bad.extend(latin1(&row("2", "JOSÉ")));
        with_bad.push(b'\n');

        let decoder = RecordDecoder::new(SourceEncoding::Utf8);
        let clean = decoder.decode(good.as_slice()).expect("decode");
        let dirty = decoder.decode(with_bad.as_slice()).expect("decode");
        assert_eq!(dirty.rejected, 1);
        assert_eq!(clean.rows, dirty.rows);
        assert_ne!(clean.checksum, dirty.checksum);

        let mut expected = md5::Context::new();
        expected.consume(row("1", "A"));
        expected.consume(latin1(&row("2", "JOSÉ")));
        assert_eq!(dirty.checksum, format!("{:x}", expected.compute()));
    }

    #[test]
    fn declared_entry_size_does_not_drive_unbounded_allocation() {
        assert_eq!(preallocation(1024), 1024);
        assert_eq!(preallocation(u64::MAX), PREALLOCATION_LIMIT);
    }

    #[test]
    fn unknown_header_column_rejects_rows() {
        let text = format!(
            "{}\n{}\n",
            header().replace("horasCatedra", "horas"),
            row("1", "A")
        );
        let table = RecordDecoder::default().decode(text.as_bytes()).expect("decode");
        assert_eq!(table.row_count, 1);
        assert_eq!(table.rejected, 1);
        assert!(table.rows.is_empty());
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in entries {
            writer.start_file(*name, options).expect("start entry");
            writer.write_all(body).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn extracts_named_table_from_archive() {
        let period: Period = "2017-05".parse().unwrap();
        let archive = zip_with(&[
            ("LEEME.txt", b"readme"),
            ("nomina_2017-05.csv", b"a,b\n1,2\n"),
        ]);
        let table = extract_period_table(&archive, &period).expect("extract");
        assert_eq!(table, b"a,b\n1,2\n");
    }

    #[test]
    fn falls_back_to_single_csv_entry() {
        let period: Period = "2017-05".parse().unwrap();
        let archive = zip_with(&[("export.CSV", b"x\n")]);
        assert_eq!(extract_period_table(&archive, &period).expect("extract"), b"x\n");

        let ambiguous = zip_with(&[("a.csv", b"x\n"), ("b.csv", b"y\n")]);
        assert!(matches!(
            extract_period_table(&ambiguous, &period),
            Err(DecodeError::MissingTable { .. })
        ));
    }
}
