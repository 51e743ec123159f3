//! Row 이벤트의 컬럼 값 디코딩
//!
//! 테이블 맵 이벤트의 컬럼 타입/메타데이터를 이용해 row image 를 `CellValue` 로 변환합니다.

use crate::error::{ReplicationError, Result};
use crate::events::{CellValue, ColumnMeta, Row, TableMapData};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::DateTime;
use std::io::{Cursor, Read};

/// MySQL 컬럼 타입 코드
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

use column_type::*;

const DIG_PER_DEC: usize = 9;
const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

pub(crate) type ByteCursor<'a> = Cursor<&'a [u8]>;

pub(crate) fn truncated(what: &str) -> impl Fn(std::io::Error) -> ReplicationError + '_ {
    move |e| ReplicationError::BinlogParseError(format!("truncated {}: {}", what, e))
}

/// LCB (Length-Coded Binary) 읽기
pub(crate) fn read_lenenc_int(cursor: &mut ByteCursor<'_>) -> Result<u64> {
    let byte = cursor.read_u8().map_err(truncated("length-encoded integer"))?;
    let value = match byte {
        0..=0xfa => Ok(byte as u64),
        0xfc => cursor.read_u16::<LittleEndian>().map(u64::from),
        0xfd => cursor.read_u24::<LittleEndian>().map(u64::from),
        0xfe => cursor.read_u64::<LittleEndian>(),
        _ => {
            return Err(ReplicationError::BinlogParseError(format!(
                "invalid length-encoded integer prefix 0x{:02x}",
                byte
            )))
        }
    }
    .map_err(truncated("length-encoded integer"))?;
    Ok(value)
}

pub(crate) fn read_bytes(cursor: &mut ByteCursor<'_>, len: usize, what: &str) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(ReplicationError::BinlogParseError(format!(
            "truncated {}: need {} bytes, {} left",
            what, len, remaining
        )));
    }
    let mut buffer = vec![0u8; len];
    cursor.read_exact(&mut buffer).map_err(truncated(what))?;
    Ok(buffer)
}

fn is_bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

pub(crate) fn count_bits(bitmap: &[u8], len: usize) -> usize {
    (0..len).filter(|i| is_bit_set(bitmap, *i)).count()
}

/// 테이블 맵 이벤트의 메타데이터 블록을 컬럼별 값으로 해석
pub fn parse_column_meta(column_types: &[u8], data: &[u8]) -> Result<Vec<ColumnMeta>> {
    let mut cursor = Cursor::new(data);
    let mut meta = Vec::with_capacity(column_types.len());

    for &column_type in column_types {
        let value = match column_type {
            FLOAT | DOUBLE | BLOB | GEOMETRY | JSON | TIMESTAMP2 | DATETIME2 | TIME2 => {
                cursor.read_u8().map(u16::from)
            }
            VARCHAR | VAR_STRING | BIT => cursor.read_u16::<LittleEndian>(),
            NEWDECIMAL | STRING | ENUM | SET => cursor.read_u16::<BigEndian>(),
            _ => Ok(0),
        }
        .map_err(truncated("column metadata"))?;
        meta.push(value);
    }

    Ok(meta)
}

/// row image 하나 디코딩
pub fn decode_row(cursor: &mut ByteCursor<'_>, table: &TableMapData, present: &[u8]) -> Result<Row> {
    let column_count = table.column_types.len();
    let present_count = count_bits(present, column_count);
    let null_bitmap = read_bytes(cursor, (present_count + 7) / 8, "row null bitmap")?;

    let mut row = Vec::with_capacity(column_count);
    let mut null_index = 0;
    for index in 0..column_count {
        if !is_bit_set(present, index) {
            row.push(CellValue::Null);
            continue;
        }

        let is_null = is_bit_set(&null_bitmap, null_index);
        null_index += 1;
        if is_null {
            row.push(CellValue::Null);
            continue;
        }

        let meta = table.column_meta.get(index).copied().unwrap_or(0);
        row.push(decode_cell(cursor, table.column_types[index], meta)?);
    }

    Ok(row)
}

/// 컬럼 값 하나 디코딩
pub fn decode_cell(cursor: &mut ByteCursor<'_>, column_type: u8, meta: ColumnMeta) -> Result<CellValue> {
    let (column_type, length) = real_type(column_type, meta);
    let err = truncated("column value");

    let value = match column_type {
        NULL => CellValue::Null,
        TINY => CellValue::Int8(cursor.read_i8().map_err(&err)?),
        SHORT => CellValue::Int16(cursor.read_i16::<LittleEndian>().map_err(&err)?),
        INT24 => CellValue::Int32(cursor.read_i24::<LittleEndian>().map_err(&err)?),
        LONG => CellValue::Int32(cursor.read_i32::<LittleEndian>().map_err(&err)?),
        LONGLONG => CellValue::Int64(cursor.read_i64::<LittleEndian>().map_err(&err)?),
        FLOAT => CellValue::Float(cursor.read_f32::<LittleEndian>().map_err(&err)?),
        DOUBLE => CellValue::Double(cursor.read_f64::<LittleEndian>().map_err(&err)?),
        NEWDECIMAL => CellValue::Decimal(decode_decimal(
            cursor,
            (meta >> 8) as usize,
            (meta & 0xff) as usize,
        )?),
        VARCHAR | VAR_STRING => decode_string(cursor, meta as usize)?,
        STRING => decode_string(cursor, length)?,
        ENUM => match length {
            1 => CellValue::UInt16(cursor.read_u8().map_err(&err)? as u16),
            2 => CellValue::UInt16(cursor.read_u16::<LittleEndian>().map_err(&err)?),
            other => {
                return Err(ReplicationError::BinlogParseError(format!(
                    "unknown ENUM pack length {}",
                    other
                )))
            }
        },
        SET => CellValue::UInt64(read_uint_le(cursor, length)?),
        BIT => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xff) as usize;
            let len = (bits + 7) / 8;
            CellValue::UInt64(cursor.read_uint::<BigEndian>(len.clamp(1, 8)).map_err(&err)?)
        }
        TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | BLOB | GEOMETRY | JSON => {
            let len = read_uint_le(cursor, meta as usize)? as usize;
            CellValue::Bytes(read_bytes(cursor, len, "blob value")?)
        }
        TIMESTAMP => {
            let secs = cursor.read_u32::<LittleEndian>().map_err(&err)?;
            timestamp_value(secs as i64, 0)?
        }
        TIMESTAMP2 => {
            let secs = cursor.read_u32::<BigEndian>().map_err(&err)?;
            let micros = read_fraction(cursor, meta as usize)?;
            timestamp_value(secs as i64, micros)?
        }
        DATETIME => {
            let packed = cursor.read_u64::<LittleEndian>().map_err(&err)?;
            let (date, time) = (packed / 1_000_000, packed % 1_000_000);
            CellValue::DateTime(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                date / 10000,
                (date % 10000) / 100,
                date % 100,
                time / 10000,
                (time % 10000) / 100,
                time % 100
            ))
        }
        DATETIME2 => CellValue::DateTime(decode_datetime2(cursor, meta as usize)?),
        DATE | NEWDATE => {
            let packed = cursor.read_u24::<LittleEndian>().map_err(&err)?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0f,
                packed & 0x1f
            ))
        }
        TIME => {
            let packed = cursor.read_u24::<LittleEndian>().map_err(&err)?;
            CellValue::Time(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed % 10000) / 100,
                packed % 100
            ))
        }
        TIME2 => CellValue::Time(decode_time2(cursor, meta as usize)?),
        YEAR => {
            let year = cursor.read_u8().map_err(&err)?;
            CellValue::Year(if year == 0 { 0 } else { year as u16 + 1900 })
        }
        other => {
            return Err(ReplicationError::BinlogParseError(format!(
                "unsupported column type {}",
                other
            )))
        }
    };

    Ok(value)
}

/// STRING 컬럼은 메타데이터에 실제 타입(ENUM/SET/STRING)과 길이가 함께 들어있음
fn real_type(column_type: u8, meta: ColumnMeta) -> (u8, usize) {
    if column_type != STRING {
        return (column_type, 0);
    }
    if meta < 256 {
        return (STRING, meta as usize);
    }

    let byte0 = (meta >> 8) as u8;
    let byte1 = (meta & 0xff) as usize;
    if byte0 & 0x30 != 0x30 {
        // 길이가 255 를 넘는 CHAR 는 길이 상위 비트가 타입 바이트에 섞여 있음
        let length = byte1 | ((((byte0 & 0x30) ^ 0x30) as usize) << 4);
        (byte0 | 0x30, length)
    } else {
        (byte0, byte1)
    }
}

fn read_uint_le(cursor: &mut ByteCursor<'_>, len: usize) -> Result<u64> {
    if len == 0 || len > 8 {
        return Err(ReplicationError::BinlogParseError(format!(
            "invalid integer width {}",
            len
        )));
    }
    cursor
        .read_uint::<LittleEndian>(len)
        .map_err(truncated("column value"))
}

fn decode_string(cursor: &mut ByteCursor<'_>, max_length: usize) -> Result<CellValue> {
    let len = if max_length < 256 {
        cursor.read_u8().map(usize::from)
    } else {
        cursor.read_u16::<LittleEndian>().map(usize::from)
    }
    .map_err(truncated("string length"))?;

    let bytes = read_bytes(cursor, len, "string value")?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => CellValue::String(text),
        Err(e) => CellValue::Bytes(e.into_bytes()),
    })
}

fn timestamp_value(secs: i64, micros: u32) -> Result<CellValue> {
    DateTime::from_timestamp(secs, micros * 1000)
        .map(CellValue::Timestamp)
        .ok_or_else(|| ReplicationError::BinlogParseError(format!("timestamp out of range: {}", secs)))
}

fn fraction_bytes(fsp: usize) -> usize {
    (fsp + 1) / 2
}

/// 소수 초 부분을 마이크로초로
fn read_fraction(cursor: &mut ByteCursor<'_>, fsp: usize) -> Result<u32> {
    let err = truncated("fractional seconds");
    let micros = match fsp {
        1 | 2 => cursor.read_u8().map_err(&err)? as u32 * 10_000,
        3 | 4 => cursor.read_u16::<BigEndian>().map_err(&err)? as u32 * 100,
        5 | 6 => cursor.read_u24::<BigEndian>().map_err(&err)?,
        _ => 0,
    };
    Ok(micros)
}

fn format_fraction(micros: u32, fsp: usize) -> String {
    if fsp == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", &digits[..fsp.min(6)])
}

fn decode_datetime2(cursor: &mut ByteCursor<'_>, fsp: usize) -> Result<String> {
    let packed = cursor
        .read_uint::<BigEndian>(5)
        .map_err(truncated("DATETIME2 value"))? as i64
        - 0x80_0000_0000;
    let micros = read_fraction(cursor, fsp)?;

    let ymd = packed >> 17;
    let ym = ymd >> 5;
    let hms = packed % (1 << 17);

    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        format_fraction(micros, fsp)
    ))
}

fn decode_time2(cursor: &mut ByteCursor<'_>, fsp: usize) -> Result<String> {
    let frac_len = fraction_bytes(fsp.min(6));
    let total = 3 + frac_len;
    let raw = cursor
        .read_uint::<BigEndian>(total)
        .map_err(truncated("TIME2 value"))? as i64;
    let packed = raw - (0x80_0000_i64 << (frac_len * 8));

    let negative = packed < 0;
    let magnitude = packed.unsigned_abs();
    let int_part = magnitude >> (frac_len * 8);
    let frac = (magnitude & ((1u64 << (frac_len * 8)) - 1)) as u32;
    let micros = match frac_len {
        1 => frac * 10_000,
        2 => frac * 100,
        _ => frac,
    };

    Ok(format!(
        "{}{:02}:{:02}:{:02}{}",
        if negative { "-" } else { "" },
        (int_part >> 12) & 0x3ff,
        (int_part >> 6) & 0x3f,
        int_part & 0x3f,
        format_fraction(micros, fsp)
    ))
}

/// NEWDECIMAL 바이너리 형식 디코딩
fn decode_decimal(cursor: &mut ByteCursor<'_>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision || precision > 65 {
        return Err(ReplicationError::BinlogParseError(format!(
            "invalid decimal({}, {})",
            precision, scale
        )));
    }
    let integral = precision - scale;
    let (uncomp_int, comp_int) = (integral / DIG_PER_DEC, integral % DIG_PER_DEC);
    let (uncomp_frac, comp_frac) = (scale / DIG_PER_DEC, scale % DIG_PER_DEC);
    let size = uncomp_int * 4 + DIG_TO_BYTES[comp_int] + uncomp_frac * 4 + DIG_TO_BYTES[comp_frac];

    let mut data = read_bytes(cursor, size, "decimal value")?;
    if data.is_empty() {
        return Ok("0".to_string());
    }

    // 부호 비트가 0 이면 음수이며 나머지 바이트가 모두 반전되어 있음
    let negative = data[0] & 0x80 == 0;
    data[0] ^= 0x80;
    if negative {
        data.iter_mut().for_each(|b| *b ^= 0xff);
    }

    let mut pos = 0;
    let mut read_be = |len: usize| -> u64 {
        let value = data[pos..pos + len]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        pos += len;
        value
    };

    let mut int_digits = String::new();
    if comp_int > 0 {
        int_digits.push_str(&read_be(DIG_TO_BYTES[comp_int]).to_string());
    }
    for _ in 0..uncomp_int {
        int_digits.push_str(&format!("{:09}", read_be(4)));
    }

    let mut frac_digits = String::new();
    for _ in 0..uncomp_frac {
        frac_digits.push_str(&format!("{:09}", read_be(4)));
    }
    if comp_frac > 0 {
        let value = read_be(DIG_TO_BYTES[comp_frac]);
        frac_digits.push_str(&format!("{:0width$}", value, width = comp_frac));
    }

    let int_digits = match int_digits.trim_start_matches('0') {
        "" => "0",
        digits => digits,
    };

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(int_digits);
    if scale > 0 {
        result.push('.');
        result.push_str(&frac_digits);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(column_type: u8, meta: ColumnMeta, data: &[u8]) -> CellValue {
        let mut cursor = Cursor::new(data);
        let value = decode_cell(&mut cursor, column_type, meta).unwrap();
        assert_eq!(cursor.position() as usize, data.len(), "all bytes consumed");
        value
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut cursor = Cursor::new(&[0xfa][..]);
        assert_eq!(read_lenenc_int(&mut cursor).unwrap(), 250);

        let mut cursor = Cursor::new(&[0xfc, 0x34, 0x12][..]);
        assert_eq!(read_lenenc_int(&mut cursor).unwrap(), 0x1234);

        let mut cursor = Cursor::new(&[0xfd, 0x01, 0x02, 0x03][..]);
        assert_eq!(read_lenenc_int(&mut cursor).unwrap(), 0x030201);

        let mut cursor = Cursor::new(&[0xfc, 0x01][..]);
        assert!(read_lenenc_int(&mut cursor).is_err());
    }

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode(TINY, 0, &[0xff]), CellValue::Int8(-1));
        assert_eq!(decode(SHORT, 0, &[0x39, 0x30]), CellValue::Int16(12345));
        assert_eq!(decode(INT24, 0, &[0xff, 0xff, 0xff]), CellValue::Int32(-1));
        assert_eq!(decode(LONG, 0, &42i32.to_le_bytes()), CellValue::Int32(42));
        assert_eq!(decode(LONGLONG, 0, &(-7i64).to_le_bytes()), CellValue::Int64(-7));
        assert_eq!(decode(DOUBLE, 8, &1.5f64.to_le_bytes()), CellValue::Double(1.5));
    }

    #[test]
    fn test_decode_decimal() {
        // DECIMAL(10,2): 4 바이트 정수부 + 1 바이트 소수부
        let positive = [0x80, 0x00, 0x04, 0xd2, 0x38];
        assert_eq!(decode(NEWDECIMAL, (10 << 8) | 2, &positive), CellValue::Decimal("1234.56".into()));

        let negative: Vec<u8> = positive.iter().map(|b| b ^ 0xff).collect();
        assert_eq!(decode(NEWDECIMAL, (10 << 8) | 2, &negative), CellValue::Decimal("-1234.56".into()));

        // DECIMAL(20,0): 1 바이트 + 4 바이트 그룹 2개, 값 1
        let grouped = [0x80, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(decode(NEWDECIMAL, 20 << 8, &grouped), CellValue::Decimal("1".into()));
    }

    #[test]
    fn test_decode_strings() {
        assert_eq!(decode(VARCHAR, 20, &[3, b'a', b'b', b'c']), CellValue::String("abc".into()));
        assert_eq!(
            decode(VARCHAR, 1000, &[2, 0, 0xff, 0xfe]),
            CellValue::Bytes(vec![0xff, 0xfe])
        );
        // CHAR(10): real type STRING, length 10
        let meta = ((STRING as u16) << 8) | 10;
        assert_eq!(decode(STRING, meta, &[2, b'o', b'k']), CellValue::String("ok".into()));
        // ENUM 1 byte
        let meta = ((ENUM as u16) << 8) | 1;
        assert_eq!(decode(STRING, meta, &[3]), CellValue::UInt16(3));
        assert_eq!(decode(BLOB, 2, &[2, 0, 1, 2]), CellValue::Bytes(vec![1, 2]));
    }

    #[test]
    fn test_decode_temporal() {
        // 2023-11-14 (year<<9 | month<<5 | day)
        let packed: u32 = (2023 << 9) | (11 << 5) | 14;
        assert_eq!(decode(DATE, 0, &packed.to_le_bytes()[..3]), CellValue::Date("2023-11-14".into()));

        // DATETIME2(0) 2021-03-04 05:06:07
        let ym: i64 = 2021 * 13 + 3;
        let ymd = (ym << 5) | 4;
        let hms: i64 = (5 << 12) | (6 << 6) | 7;
        let value = ((ymd << 17) | hms) + 0x80_0000_0000;
        let bytes = value.to_be_bytes();
        assert_eq!(
            decode(DATETIME2, 0, &bytes[3..]),
            CellValue::DateTime("2021-03-04 05:06:07".into())
        );

        // DATETIME2(3) 같은 시각 + .250
        let mut with_frac = bytes[3..].to_vec();
        with_frac.extend_from_slice(&2500u16.to_be_bytes());
        assert_eq!(
            decode(DATETIME2, 3, &with_frac),
            CellValue::DateTime("2021-03-04 05:06:07.250".into())
        );

        // TIME2(0) 10:20:30
        let time: i64 = ((10 << 12) | (20 << 6) | 30) + 0x80_0000;
        assert_eq!(decode(TIME2, 0, &time.to_be_bytes()[5..]), CellValue::Time("10:20:30".into()));

        // TIME2(0) -01:00:00
        let time: i64 = 0x80_0000 - (1 << 12);
        assert_eq!(decode(TIME2, 0, &time.to_be_bytes()[5..]), CellValue::Time("-01:00:00".into()));

        assert_eq!(decode(YEAR, 0, &[123]), CellValue::Year(2023));

        let value = decode(TIMESTAMP2, 0, &1_700_000_000u32.to_be_bytes());
        assert_eq!(value.as_string().as_deref(), Some("2023-11-14T22:13:20+00:00"));
    }

    #[test]
    fn test_decode_row_with_nulls() {
        let table = TableMapData {
            table_id: 1,
            database: "shop".into(),
            table: "orders".into(),
            column_types: vec![LONG, VARCHAR, LONG],
            column_meta: vec![0, 50, 0],
            nullable_bitmap: vec![0b110],
        };
        // null bitmap: 두 번째 컬럼 NULL
        let mut data = vec![0b010];
        data.extend_from_slice(&7i32.to_le_bytes());
        data.extend_from_slice(&9i32.to_le_bytes());

        let mut cursor = Cursor::new(&data[..]);
        let row = decode_row(&mut cursor, &table, &[0b111]).unwrap();
        assert_eq!(row, vec![CellValue::Int32(7), CellValue::Null, CellValue::Int32(9)]);
    }

    #[test]
    fn test_parse_column_meta() {
        let types = [LONG, VARCHAR, NEWDECIMAL, DATETIME2, STRING];
        let data = [0x2c, 0x01, 10, 2, 6, ENUM, 1];
        let meta = parse_column_meta(&types, &data).unwrap();
        assert_eq!(meta, vec![0, 300, (10 << 8) | 2, 6, ((ENUM as u16) << 8) | 1]);
    }
}
