use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{Event, Transaction};

/// Write one `[len][payload][crc]` record.
fn encode_record<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    let payload =
        bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record payload, or `None` at the end of the usable log.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only event log.
///
/// Record: `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.
/// A torn or corrupt tail (crash mid-write) ends replay at the last good record.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_all(path)
    }
}

/// Every intact record in a file. A missing file has none.
fn read_all<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    while let Some(payload) = read_record(&mut reader)? {
        match bincode::deserialize::<T>(&payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("replay of {} stopped at undecodable record: {e}", path.display());
                break;
            }
        }
    }
    Ok(records)
}

/// Ledger rows moved out of memory at compaction. Same record framing as the
/// WAL, one `Transaction` per record, never rewritten.
pub struct LedgerArchive;

impl LedgerArchive {
    /// The archive that sits next to a WAL file.
    pub fn path_for(wal_path: &Path) -> PathBuf {
        wal_path.with_extension("ledger")
    }

    /// Append rows and fsync. An empty slice touches nothing.
    pub fn append(path: &Path, rows: &[Transaction]) -> io::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        for row in rows {
            encode_record(&mut writer, row)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    pub fn read(path: &Path) -> io::Result<Vec<Transaction>> {
        read_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stockhold_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn warehouse(code: &str) -> Event {
        Event::WarehouseCreated(Warehouse {
            id: Ulid::new(),
            name: format!("Warehouse {code}"),
            code: code.into(),
            address: Address::default(),
            is_active: true,
            priority: 1,
            created_at: 0,
            updated_at: 0,
        })
    }

    fn item_updated() -> Event {
        Event::ItemUpdated {
            id: Ulid::new(),
            reorder_point: 3,
            reorder_quantity: 10,
            status: None,
            at: 42,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![warehouse("A"), item_updated()];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let path = tmp_path("torn_tail.wal");
        let event = warehouse("A");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = warehouse("A");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&item_updated()).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_replaces_history() {
        let path = tmp_path("compact.wal");
        let snapshot = vec![warehouse("KEEP")];
        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..20 {
                wal.append(&warehouse(&format!("W{i}"))).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 20);
        }
        let before = fs::metadata(&path).unwrap().len();

        let tail = item_updated();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&tail).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), tail]);
        let _ = fs::remove_file(&path);
    }

    fn receipt(quantity: i64) -> Transaction {
        Transaction {
            id: Ulid::new(),
            inventory_item_id: Ulid::new(),
            transaction_type: TransactionType::Receive,
            quantity,
            warehouse_id: Ulid::new(),
            reference_id: None,
            reference_type: None,
            notes: None,
            created_by: "ops".into(),
            created_at: 7,
        }
    }

    #[test]
    fn ledger_archive_only_grows() {
        let wal_path = tmp_path("archive.wal");
        let path = LedgerArchive::path_for(&wal_path);
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("ledger"));
        let _ = fs::remove_file(&path);

        assert!(LedgerArchive::read(&path).unwrap().is_empty());
        LedgerArchive::append(&path, &[]).unwrap();
        assert!(!path.exists());

        let first = vec![receipt(1), receipt(2)];
        let second = vec![receipt(3)];
        LedgerArchive::append(&path, &first).unwrap();
        LedgerArchive::append(&path, &second).unwrap();
        let all: Vec<Transaction> = first.into_iter().chain(second).collect();
        assert_eq!(LedgerArchive::read(&path).unwrap(), all);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| item_updated()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
