//! GTID (Global Transaction ID) 집합
//!
//! MySQL 형식: `uuid:1-100:200,uuid2:1-50` (시퀀스 구간 집합)
//! MariaDB 형식: `domain-server-sequence,domain2-server-sequence` (도메인별 마지막 GTID)

use crate::config::Flavor;
use crate::error::{ReplicationError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(ReplicationError::GtidError(format!(
                "invalid range {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn covers(&self, other: &GtidRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// 겹치거나 연접한 범위 병합
    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let parse_seq = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| ReplicationError::GtidError(format!("invalid sequence: {}", text)))
        };
        match text.split_once('-') {
            Some((start, end)) => GtidRange::new(parse_seq(start)?, parse_seq(end)?),
            None => {
                let seq = parse_seq(text)?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 서버 UUID 하나의 GTID 범위들 (정렬 + 병합 상태 유지)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidSet {
    pub sid: Uuid,
    pub ranges: Vec<GtidRange>,
}

impl UuidSet {
    pub fn new(sid: Uuid) -> Self {
        UuidSet {
            sid,
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if let Some(joined) = last.merge(&range) {
                    *last = joined;
                    continue;
                }
            }
            merged.push(range);
        }
        self.ranges = merged;
    }

    pub fn add_gtid(&mut self, sequence: u64) -> Result<()> {
        self.add_range(GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    /// 다른 집합의 모든 범위를 포함하는지
    pub fn contains_set(&self, other: &UuidSet) -> bool {
        other
            .ranges
            .iter()
            .all(|theirs| self.ranges.iter().any(|ours| ours.covers(theirs)))
    }

    /// COM_BINLOG_DUMP_GTID 바이너리 형식. 구간의 끝은 배타적
    fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(self.sid.as_bytes())?;
        w.write_u64::<LittleEndian>(self.ranges.len() as u64)?;
        for range in &self.ranges {
            w.write_u64::<LittleEndian>(range.start)?;
            w.write_u64::<LittleEndian>(range.end + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

/// MySQL GTID 집합
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MysqlGtidSet {
    pub sets: BTreeMap<Uuid, UuidSet>,
}

impl MysqlGtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `uuid:1-5:7,uuid2:3` 형식과 `uuid:1-100,200,300-400` 형식 모두 허용
    pub fn parse(text: &str) -> Result<Self> {
        let mut gtid_set = MysqlGtidSet::new();
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        let mut current: Option<Uuid> = None;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut pieces = part.split(':');
            let head = pieces.next().unwrap_or_default();
            let (sid, ranges): (Uuid, Vec<&str>) = if part.contains(':') {
                let sid = Uuid::parse_str(head.trim())
                    .map_err(|e| ReplicationError::GtidError(format!("invalid uuid {}: {}", head, e)))?;
                (sid, pieces.collect())
            } else {
                let sid = current.ok_or_else(|| {
                    ReplicationError::GtidError(format!("range without uuid: {}", part))
                })?;
                (sid, vec![part])
            };

            let uuid_set = gtid_set.sets.entry(sid).or_insert_with(|| UuidSet::new(sid));
            for range in ranges {
                uuid_set.add_range(GtidRange::parse(range)?);
            }
            current = Some(sid);
        }

        Ok(gtid_set)
    }

    /// "uuid:sequence" 하나 추가
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (sid, sequence) = gtid
            .split_once(':')
            .ok_or_else(|| ReplicationError::GtidError(format!("invalid GTID format: {}", gtid)))?;
        let sid = Uuid::parse_str(sid)
            .map_err(|e| ReplicationError::GtidError(format!("invalid uuid {}: {}", sid, e)))?;
        let sequence = sequence
            .parse::<u64>()
            .map_err(|_| ReplicationError::GtidError(format!("invalid sequence: {}", sequence)))?;

        self.sets
            .entry(sid)
            .or_insert_with(|| UuidSet::new(sid))
            .add_gtid(sequence)
    }

    pub fn union(&mut self, other: &MysqlGtidSet) {
        for (sid, theirs) in &other.sets {
            let ours = self.sets.entry(*sid).or_insert_with(|| UuidSet::new(*sid));
            for range in &theirs.ranges {
                ours.add_range(*range);
            }
        }
    }

    pub fn contains(&self, other: &MysqlGtidSet) -> bool {
        other.sets.iter().all(|(sid, theirs)| {
            theirs.ranges.is_empty()
                || self
                    .sets
                    .get(sid)
                    .map(|ours| ours.contains_set(theirs))
                    .unwrap_or(false)
        })
    }

    pub fn contains_gtid(&self, gtid: &str) -> bool {
        let Some((sid, sequence)) = gtid.split_once(':') else {
            return false;
        };
        match (Uuid::parse_str(sid), sequence.parse::<u64>()) {
            (Ok(sid), Ok(sequence)) => self
                .sets
                .get(&sid)
                .map(|set| set.contains(sequence))
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }

    /// COM_BINLOG_DUMP_GTID 에 실리는 바이너리 인코딩
    pub fn encode(&self) -> Vec<u8> {
        let non_empty: Vec<&UuidSet> = self.sets.values().filter(|s| !s.ranges.is_empty()).collect();
        let mut buffer = Vec::with_capacity(8 + non_empty.len() * 40);
        // Vec 에 대한 쓰기는 실패하지 않음
        let _ = buffer.write_u64::<LittleEndian>(non_empty.len() as u64);
        for set in non_empty {
            let _ = set.encode(&mut buffer);
        }
        buffer
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|set| !set.ranges.is_empty())
            .map(|set| set.to_string())
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// MariaDB GTID (domain-server-sequence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl MariadbGtid {
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.trim().split('-').collect();
        if parts.len() != 3 {
            return Err(ReplicationError::GtidError(format!(
                "invalid MariaDB GTID: {}",
                text
            )));
        }
        let invalid = |_| ReplicationError::GtidError(format!("invalid MariaDB GTID: {}", text));
        Ok(MariadbGtid {
            domain_id: parts[0].parse().map_err(invalid)?,
            server_id: parts[1].parse().map_err(invalid)?,
            sequence: parts[2].parse().map_err(invalid)?,
        })
    }
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

/// MariaDB GTID 위치 (도메인별 마지막 GTID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidSet {
    pub sets: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut gtid_set = MariadbGtidSet::new();
        for part in text.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            gtid_set.add_gtid(MariadbGtid::parse(part)?);
        }
        Ok(gtid_set)
    }

    /// 도메인별로 더 큰 시퀀스만 유지
    pub fn add_gtid(&mut self, gtid: MariadbGtid) {
        match self.sets.get(&gtid.domain_id) {
            Some(existing) if existing.sequence >= gtid.sequence => {}
            _ => {
                self.sets.insert(gtid.domain_id, gtid);
            }
        }
    }

    pub fn union(&mut self, other: &MariadbGtidSet) {
        for gtid in other.sets.values() {
            self.add_gtid(*gtid);
        }
    }

    pub fn contains(&self, other: &MariadbGtidSet) -> bool {
        other.sets.values().all(|theirs| {
            self.sets
                .get(&theirs.domain_id)
                .map(|ours| ours.sequence >= theirs.sequence)
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.sets.values().map(|g| g.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// flavor 별 GTID 집합
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GtidSet {
    Mysql(MysqlGtidSet),
    Mariadb(MariadbGtidSet),
}

impl GtidSet {
    pub fn new(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Mysql => GtidSet::Mysql(MysqlGtidSet::new()),
            Flavor::Mariadb => GtidSet::Mariadb(MariadbGtidSet::new()),
        }
    }

    pub fn parse(flavor: Flavor, text: &str) -> Result<Self> {
        match flavor {
            Flavor::Mysql => MysqlGtidSet::parse(text).map(GtidSet::Mysql),
            Flavor::Mariadb => MariadbGtidSet::parse(text).map(GtidSet::Mariadb),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            GtidSet::Mysql(_) => Flavor::Mysql,
            GtidSet::Mariadb(_) => Flavor::Mariadb,
        }
    }

    /// 다른 flavor 의 집합은 포함하지 않는 것으로 간주
    pub fn contains(&self, other: &GtidSet) -> bool {
        match (self, other) {
            (GtidSet::Mysql(ours), GtidSet::Mysql(theirs)) => ours.contains(theirs),
            (GtidSet::Mariadb(ours), GtidSet::Mariadb(theirs)) => ours.contains(theirs),
            _ => false,
        }
    }

    pub fn union(&mut self, other: &GtidSet) -> Result<()> {
        match (self, other) {
            (GtidSet::Mysql(ours), GtidSet::Mysql(theirs)) => ours.union(theirs),
            (GtidSet::Mariadb(ours), GtidSet::Mariadb(theirs)) => ours.union(theirs),
            (ours, theirs) => {
                return Err(ReplicationError::GtidError(format!(
                    "cannot merge {} set into {} set",
                    theirs.flavor(),
                    ours.flavor()
                )))
            }
        }
        Ok(())
    }

    /// GTID 하나 추가 (MySQL: "uuid:seq", MariaDB: "d-s-n")
    pub fn update(&mut self, gtid: &str) -> Result<()> {
        match self {
            GtidSet::Mysql(set) => set.add_gtid(gtid),
            GtidSet::Mariadb(set) => {
                set.add_gtid(MariadbGtid::parse(gtid)?);
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GtidSet::Mysql(set) => set.is_empty(),
            GtidSet::Mariadb(set) => set.is_empty(),
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtidSet::Mysql(set) => fmt::Display::fmt(set, f),
            GtidSet::Mariadb(set) => fmt::Display::fmt(set, f),
        }
    }
}
