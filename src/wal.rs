use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::model::{CancelReason, Event, Reservation, ReservationStatus, TableState};

const MAGIC: &[u8; 7] = b"SEATLOG";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 8;
/// A length prefix above this is read as corruption, not allocated.
const MAX_ENTRY_LEN: u32 = 1 << 20;
/// Length prefix plus trailing crc.
const ENTRY_OVERHEAD: u64 = 8;

fn header() -> [u8; HEADER_LEN as usize] {
    let mut head = [0u8; HEADER_LEN as usize];
    head[..MAGIC.len()].copy_from_slice(MAGIC);
    head[MAGIC.len()] = FORMAT_VERSION;
    head
}

fn check_header(head: &[u8]) -> io::Result<()> {
    if &head[..MAGIC.len()] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a seatline reservation log"));
    }
    match head[MAGIC.len()] {
        FORMAT_VERSION => Ok(()),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported reservation log version {other}"),
        )),
    }
}

/// `[u32 len][bincode Event][u32 crc32]`, little endian. Returns bytes written.
fn write_entry(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_ENTRY_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "event too large for reservation log"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(ENTRY_OVERHEAD + u64::from(len))
}

/// Fill `buf`, or report `false` if the file ends first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact entry and its size on disk. `None` at the end of the log or at
/// the first torn or corrupt entry; everything after it is unreachable.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_ENTRY_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, ENTRY_OVERHEAD + u64::from(len))))
}

/// What a log file held when it was read back.
#[derive(Debug, Default)]
pub struct Recovery {
    pub events: Vec<Event>,
    /// Header plus every intact entry.
    pub valid_len: u64,
    /// Bytes after the last intact entry (a torn write or corruption).
    pub discarded: u64,
}

impl Recovery {
    /// Tables and reservations that exist once every event is applied.
    pub fn live_counts(&self) -> (usize, usize) {
        let mut tables = HashSet::new();
        let mut reservations = HashSet::new();
        for event in &self.events {
            match event {
                Event::TableCreated { id, .. } => {
                    tables.insert(*id);
                }
                Event::TableDeleted { id } => {
                    tables.remove(id);
                }
                Event::ReservationCreated { id, .. } => {
                    reservations.insert(*id);
                }
                Event::ReservationDeleted { id } => {
                    reservations.remove(id);
                }
                _ => {}
            }
        }
        (tables.len(), reservations.len())
    }
}

/// Shortest event sequence that rebuilds the given tables and reservation
/// records: live tables first, then each reservation as created plus its
/// terminal status.
pub fn checkpoint_events<'a>(
    tables: impl IntoIterator<Item = &'a TableState>,
    records: impl IntoIterator<Item = Reservation>,
) -> Vec<Event> {
    let mut events: Vec<Event> = tables
        .into_iter()
        .filter(|t| !t.retired)
        .map(|t| Event::TableCreated {
            id: t.id,
            label: t.label.clone(),
            geometry: t.geometry,
            capacity: t.capacity,
        })
        .collect();

    let mut records: Vec<Reservation> = records.into_iter().collect();
    records.sort_by_key(|r| r.id);
    for r in records {
        let id = r.id;
        let status = match r.status {
            ReservationStatus::Pending => None,
            ReservationStatus::Confirmed => Some(Event::ReservationConfirmed { id }),
            ReservationStatus::Cancelled => Some(Event::ReservationCancelled {
                id,
                reason: r.cancel_reason.unwrap_or(CancelReason::Admin),
            }),
        };
        events.push(Event::ReservationCreated {
            id,
            name: r.name,
            email: r.email,
            date: r.date,
            span: r.span,
            table_ids: r.table_ids,
            token: r.token,
            created_at: r.created_at,
        });
        events.extend(status);
    }
    events
}

/// Append-only reservation log with group commit.
///
/// A file starts with an 8 byte header (`SEATLOG` + version) followed by
/// length-prefixed, checksummed entries. Opening a log cuts off any torn
/// tail so new entries never land behind unreadable bytes.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_checkpoint: u64,
}

impl Wal {
    /// Read the log and open it for appending. A missing or empty file gets
    /// a fresh header; a torn tail is truncated away.
    pub fn open(path: &Path) -> io::Result<(Self, Recovery)> {
        let recovery = Self::read(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if recovery.valid_len < HEADER_LEN {
            file.set_len(0)?;
            file.write_all(&header())?;
            file.sync_all()?;
        } else if recovery.discarded > 0 {
            file.set_len(recovery.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_checkpoint: 0,
        };
        Ok((wal, recovery))
    }

    /// Read every intact event. A missing file is an empty log; a file that
    /// is not a reservation log is an error.
    pub fn read(path: &Path) -> io::Result<Recovery> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Recovery::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut head = [0u8; HEADER_LEN as usize];
        if !fill(&mut reader, &mut head)? {
            // the header itself never made it to disk
            return Ok(Recovery {
                discarded: file_len,
                ..Recovery::default()
            });
        }
        check_header(&head)?;

        let mut recovery = Recovery {
            valid_len: HEADER_LEN,
            ..Recovery::default()
        };
        while let Some((event, size)) = read_entry(&mut reader)? {
            recovery.events.push(event);
            recovery.valid_len += size;
        }
        recovery.discarded = file_len - recovery.valid_len;
        Ok(recovery)
    }

    /// Buffer one event. Nothing is durable until [`Wal::commit`].
    pub fn stage(&mut self, event: &Event) -> io::Result<()> {
        write_entry(&mut self.writer, event)?;
        self.appends_since_checkpoint += 1;
        Ok(())
    }

    /// Flush staged events and fsync: one durable commit for the whole batch.
    pub fn commit(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.stage(event)?;
        self.commit()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_checkpoint(&self) -> u64 {
        self.appends_since_checkpoint
    }

    fn checkpoint_path(path: &Path) -> PathBuf {
        path.with_extension("wal.checkpoint")
    }

    /// Write a complete replacement log next to the live one and fsync it.
    /// The live log is untouched until [`Wal::install_checkpoint`].
    pub fn write_checkpoint(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::checkpoint_path(path))?);
        writer.write_all(&header())?;
        for event in events {
            write_entry(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the checkpoint over the live log and continue appending to it.
    pub fn install_checkpoint(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::checkpoint_path(&self.path), &self.path)?;
        // make the rename itself durable
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_checkpoint = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn checkpoint(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_checkpoint(&self.path, events)?;
        self.install_checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Geometry, Span};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatline_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn table_created(id: Ulid) -> Event {
        Event::TableCreated {
            id,
            label: "T1".into(),
            geometry: Geometry { x: 0, y: 0, width: 80, height: 80 },
            capacity: 4,
        }
    }

    fn reservation(id: Ulid, table_id: Ulid, status: ReservationStatus) -> Reservation {
        Reservation {
            id,
            name: "Ada".into(),
            email: "ada@example.com".into(),
            date: NaiveDate::from_ymd_opt(2030, 5, 1).unwrap(),
            span: Span::new(1000, 2000),
            table_ids: vec![table_id],
            status,
            cancel_reason: None,
            token: id.to_string(),
            created_at: 0,
        }
    }

    fn reservation_created(id: Ulid, table_id: Ulid) -> Event {
        let r = reservation(id, table_id, ReservationStatus::Pending);
        Event::ReservationCreated {
            id,
            name: r.name,
            email: r.email,
            date: r.date,
            span: r.span,
            table_ids: r.table_ids,
            token: r.token,
            created_at: r.created_at,
        }
    }

    #[test]
    fn events_survive_reopen() {
        let path = tmp_path("reopen.wal");
        let tid = Ulid::new();
        let first = vec![table_created(tid), reservation_created(Ulid::new(), tid)];
        let second = Event::ReservationConfirmed { id: Ulid::new() };

        {
            let (mut wal, recovery) = Wal::open(&path).unwrap();
            assert!(recovery.events.is_empty());
            for e in &first {
                wal.append(e).unwrap();
            }
        }
        {
            let (mut wal, recovery) = Wal::open(&path).unwrap();
            assert_eq!(recovery.events, first);
            assert_eq!(recovery.discarded, 0);
            wal.append(&second).unwrap();
        }

        let recovery = Wal::read(&path).unwrap();
        assert_eq!(recovery.events.len(), 3);
        assert_eq!(recovery.events[2], second);
        assert_eq!(recovery.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn live_counts_follow_deletes() {
        let path = tmp_path("counts.wal");
        let (t1, t2) = (Ulid::new(), Ulid::new());
        let (r1, r2) = (Ulid::new(), Ulid::new());
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for e in [
                table_created(t1),
                table_created(t2),
                reservation_created(r1, t1),
                reservation_created(r2, t2),
                Event::ReservationCancelled { id: r1, reason: CancelReason::Admin },
                Event::ReservationDeleted { id: r2 },
                Event::TableDeleted { id: t2 },
            ] {
                wal.append(&e).unwrap();
            }
        }
        assert_eq!(Wal::read(&path).unwrap().live_counts(), (1, 1));
    }

    #[test]
    fn torn_tail_is_cut_before_appending() {
        let path = tmp_path("torn_tail.wal");
        let tid = Ulid::new();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&table_created(tid)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let rid = Ulid::new();
        {
            let (mut wal, recovery) = Wal::open(&path).unwrap();
            assert_eq!(recovery.events, vec![table_created(tid)]);
            assert_eq!(recovery.discarded, 6);
            wal.append(&reservation_created(rid, tid)).unwrap();
        }

        // the entry written after recovery is reachable
        let recovery = Wal::read(&path).unwrap();
        assert_eq!(recovery.events, vec![table_created(tid), reservation_created(rid, tid)]);
        assert_eq!(recovery.discarded, 0);
    }

    #[test]
    fn bad_checksum_ends_replay() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::ReservationDeleted { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&header()).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let recovery = Wal::read(&path).unwrap();
        assert!(recovery.events.is_empty());
        assert_eq!(recovery.valid_len, HEADER_LEN);
    }

    #[test]
    fn oversized_length_prefix_is_corruption() {
        let path = tmp_path("oversized.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&header()).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        let recovery = Wal::read(&path).unwrap();
        assert!(recovery.events.is_empty());
        assert_eq!(recovery.discarded, 4);
    }

    #[test]
    fn torn_header_is_rewritten() {
        let path = tmp_path("torn_header.wal");
        fs::write(&path, &MAGIC[..3]).unwrap();

        let tid = Ulid::new();
        {
            let (mut wal, recovery) = Wal::open(&path).unwrap();
            assert_eq!(recovery.discarded, 3);
            wal.append(&table_created(tid)).unwrap();
        }
        assert_eq!(Wal::read(&path).unwrap().events, vec![table_created(tid)]);
    }

    #[test]
    fn foreign_file_is_refused() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x01\x0e\x00 some other format").unwrap();
        let err = Wal::open(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut future = header();
        future[MAGIC.len()] = FORMAT_VERSION + 1;
        fs::write(&path, future).unwrap();
        assert!(Wal::read(&path).unwrap_err().to_string().contains("version"));
    }

    #[test]
    fn checkpoint_replaces_history() {
        let path = tmp_path("checkpoint.wal");
        let tid = Ulid::new();
        let kept = table_created(tid);
        let later = reservation_created(Ulid::new(), tid);
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            for _ in 0..10 {
                let rid = Ulid::new();
                wal.append(&reservation_created(rid, tid)).unwrap();
                wal.append(&Event::ReservationDeleted { id: rid }).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();

            wal.checkpoint(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_checkpoint(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);

            wal.append(&later).unwrap();
            assert_eq!(wal.appends_since_checkpoint(), 1);
        }

        assert_eq!(Wal::read(&path).unwrap().events, vec![kept, later]);
        assert!(!Wal::checkpoint_path(&path).exists());
    }

    #[test]
    fn checkpoint_events_rebuild_statuses() {
        let live = TableState::new(Ulid::new(), "T1".into(), Geometry::default(), 4);
        let mut retired = TableState::new(Ulid::new(), "T2".into(), Geometry::default(), 2);
        retired.retired = true;

        let pending = reservation(Ulid::new(), live.id, ReservationStatus::Pending);
        let confirmed = reservation(Ulid::new(), live.id, ReservationStatus::Confirmed);
        let mut expired = reservation(Ulid::new(), live.id, ReservationStatus::Cancelled);
        expired.cancel_reason = Some(CancelReason::Expired);

        let events = checkpoint_events(
            [&live, &retired],
            vec![expired.clone(), confirmed.clone(), pending.clone()],
        );

        // one table, three creations, two terminal statuses
        assert_eq!(events.len(), 6);
        assert!(matches!(&events[0], Event::TableCreated { id, .. } if *id == live.id));
        assert!(events.contains(&Event::ReservationConfirmed { id: confirmed.id }));
        assert!(events.contains(&Event::ReservationCancelled {
            id: expired.id,
            reason: CancelReason::Expired,
        }));
        let created: Vec<Ulid> = events
            .iter()
            .filter_map(|e| match e {
                Event::ReservationCreated { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        let mut sorted = created.clone();
        sorted.sort();
        assert_eq!(created, sorted);
    }
}
