use std::ops::Range;

use tracing::warn;

use crate::checksum;
use crate::coding::decode_fixed32;
use crate::fs::SequentialFile;

use super::{RecordType, Reporter, BLOCK_SIZE, HEADER_SIZE};

/// Outcome of decoding one physical record from the block buffer.
enum Physical {
    /// Raw type byte plus the payload's range within the block buffer. The
    /// type is left raw so unknown values can be reported with their number.
    Record { ty: u8, payload: Range<usize> },
    Eof,
    Bad,
}

/// Reassembles logical records from a log file, resynchronizing past
/// corrupted regions instead of giving up.
pub struct Reader<F: SequentialFile> {
    file: F,
    reporter: Option<Box<dyn Reporter>>,
    verify_checksums: bool,
    backing: Vec<u8>,
    /// Unconsumed region of `backing`.
    buffer_start: usize,
    buffer_end: usize,
    eof: bool,
    /// File offset of the first physical record of the last logical record
    /// returned.
    last_record_offset: u64,
    /// File offset one past the block data currently buffered.
    end_of_buffer_offset: u64,
    /// Records starting before this offset are skipped without reporting.
    initial_offset: u64,
    /// While set, Middle/Last fragments are dropped silently; cleared at the
    /// first record that can begin a logical record.
    resyncing: bool,
}

impl<F: SequentialFile> Reader<F> {
    pub fn new(
        file: F,
        reporter: Option<Box<dyn Reporter>>,
        verify_checksums: bool,
        initial_offset: u64,
    ) -> Reader<F> {
        Reader {
            file,
            reporter,
            verify_checksums,
            backing: vec![0u8; BLOCK_SIZE],
            buffer_start: 0,
            buffer_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Returns the next logical record, or `None` at end of stream.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the logical record currently being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            let outcome = self.read_physical_record();
            match outcome {
                Physical::Record { ty, payload } => {
                    let fragment_len = payload.len();
                    let physical_record_offset = self.end_of_buffer_offset
                        - self.buffer_len() as u64
                        - HEADER_SIZE as u64
                        - fragment_len as u64;

                    if self.resyncing {
                        if ty == RecordType::Middle as u8 {
                            continue;
                        }
                        if ty == RecordType::Last as u8 {
                            self.resyncing = false;
                            continue;
                        }
                        self.resyncing = false;
                    }

                    if ty == RecordType::Full as u8 {
                        if in_fragmented_record && !scratch.is_empty() {
                            self.report_corruption(scratch.len(), "partial record without end(1)");
                        }
                        self.last_record_offset = physical_record_offset;
                        return Some(self.backing[payload].to_vec());
                    } else if ty == RecordType::First as u8 {
                        if in_fragmented_record && !scratch.is_empty() {
                            self.report_corruption(scratch.len(), "partial record without end(2)");
                        }
                        prospective_record_offset = physical_record_offset;
                        scratch.clear();
                        scratch.extend_from_slice(&self.backing[payload]);
                        in_fragmented_record = true;
                    } else if ty == RecordType::Middle as u8 {
                        if !in_fragmented_record {
                            self.report_corruption(
                                fragment_len,
                                "missing start of fragmented record(1)",
                            );
                        } else {
                            scratch.extend_from_slice(&self.backing[payload]);
                        }
                    } else if ty == RecordType::Last as u8 {
                        if !in_fragmented_record {
                            self.report_corruption(
                                fragment_len,
                                "missing start of fragmented record(2)",
                            );
                        } else {
                            scratch.extend_from_slice(&self.backing[payload]);
                            self.last_record_offset = prospective_record_offset;
                            return Some(scratch);
                        }
                    } else {
                        let dropped = fragment_len
                            + if in_fragmented_record { scratch.len() } else { 0 };
                        self.report_corruption(dropped, &format!("unknown record type {ty}"));
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::Eof => {
                    // A fragment without its end at EOF means the writer died
                    // mid-record; the whole logical record is ignored.
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    /// File offset of the first fragment of the last record returned by
    /// `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    fn buffer_len(&self) -> usize {
        self.buffer_end - self.buffer_start
    }

    /// Positions the file at the block containing `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;

        // An offset inside a block's zero-filled trailer belongs to the next
        // block.
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start;
        if block_start > 0 {
            if let Err(err) = self.file.skip(block_start) {
                warn!(offset = block_start, error = %err, "log seek failed");
                self.report_drop(block_start as usize, &err.to_string());
                return false;
            }
        }
        true
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer_len() < HEADER_SIZE {
                if !self.eof {
                    // The previous read consumed a full block; the leftover
                    // is block trailer to discard.
                    self.buffer_start = 0;
                    self.buffer_end = 0;
                    match self.read_block() {
                        Ok(n) => {
                            self.end_of_buffer_offset += n as u64;
                            self.buffer_end = n;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(err) => {
                            self.buffer_start = 0;
                            self.buffer_end = 0;
                            self.report_drop(BLOCK_SIZE, &err.to_string());
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                    continue;
                }
                // A truncated header at EOF means the writer crashed
                // mid-header; not corruption.
                self.buffer_start = self.buffer_end;
                return Physical::Eof;
            }

            let header = &self.backing[self.buffer_start..self.buffer_start + HEADER_SIZE];
            let a = header[4] as usize;
            let b = header[5] as usize;
            let ty = header[6];
            let length = a | (b << 8);

            if HEADER_SIZE + length > self.buffer_len() {
                let drop_size = self.buffer_len();
                self.buffer_start = self.buffer_end;
                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // The writer died before finishing the payload; treat as a
                // clean end rather than corruption.
                return Physical::Eof;
            }

            if ty == RecordType::Zero as u8 && length == 0 {
                // Preallocated region; skip without reporting drops.
                self.buffer_start = self.buffer_end;
                return Physical::Bad;
            }

            if self.verify_checksums {
                let expected = checksum::unmask(decode_fixed32(header));
                let actual = checksum::value(
                    &self.backing[self.buffer_start + 6..self.buffer_start + HEADER_SIZE + length],
                );
                if actual != expected {
                    // The length field is covered by the header we already
                    // bounds-checked against the block, so skipping exactly
                    // this record keeps later records in the block readable.
                    let drop_size = HEADER_SIZE + length;
                    self.buffer_start += drop_size;
                    self.report_corruption(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let payload_start = self.buffer_start + HEADER_SIZE;
            self.buffer_start += HEADER_SIZE + length;

            // Skip physical records that started before initial_offset.
            if (self.end_of_buffer_offset as i64
                - self.buffer_len() as i64
                - HEADER_SIZE as i64
                - length as i64)
                < self.initial_offset as i64
            {
                return Physical::Bad;
            }

            return Physical::Record {
                ty,
                payload: payload_start..payload_start + length,
            };
        }
    }

    /// Fills `backing` from the file, tolerating short reads from the OS.
    fn read_block(&mut self) -> crate::error::Result<usize> {
        let mut total = 0;
        while total < BLOCK_SIZE {
            let n = self.file.read(&mut self.backing[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn report_corruption(&mut self, bytes: usize, reason: &str) {
        self.report_drop(bytes, reason);
    }

    fn report_drop(&mut self, bytes: usize, reason: &str) {
        let drop_start = self
            .end_of_buffer_offset
            .saturating_sub(self.buffer_len() as u64)
            .saturating_sub(bytes as u64);
        if drop_start >= self.initial_offset {
            warn!(bytes, reason, "dropping log bytes");
            if let Some(reporter) = &mut self.reporter {
                reporter.corruption(bytes, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::{Writer, MAX_RECORD_TYPE};
    use super::*;
    use crate::fs::{MemFile, MemSequentialFile};

    #[derive(Clone, Default)]
    struct CollectingReporter {
        drops: Arc<Mutex<Vec<(usize, String)>>>,
    }

    impl Reporter for CollectingReporter {
        fn corruption(&mut self, bytes: usize, reason: &str) {
            self.drops.lock().unwrap().push((bytes, reason.to_string()));
        }
    }

    fn write_records(records: &[Vec<u8>]) -> Vec<u8> {
        let mut file = MemFile::new();
        {
            let mut writer = Writer::new(&mut file);
            for record in records {
                writer.append_record(record).unwrap();
            }
        }
        file.data
    }

    fn reader_over(data: Vec<u8>, reporter: CollectingReporter) -> Reader<MemSequentialFile> {
        Reader::new(
            MemSequentialFile::new(data),
            Some(Box::new(reporter)),
            true,
            0,
        )
    }

    fn read_all(reader: &mut Reader<MemSequentialFile>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(record) = reader.read_record() {
            out.push(record);
        }
        out
    }

    fn big_record(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn empty_log() {
        let reporter = CollectingReporter::default();
        let mut reader = reader_over(Vec::new(), reporter.clone());
        assert!(reader.read_record().is_none());
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn small_records_round_trip() {
        let records = vec![b"foo".to_vec(), b"bar".to_vec(), Vec::new(), b"xxxx".to_vec()];
        let reporter = CollectingReporter::default();
        let mut reader = reader_over(write_records(&records), reporter.clone());
        assert_eq!(read_all(&mut reader), records);
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn fragments_span_blocks() {
        // The middle record spans three blocks:
        // First(32761) + Middle(32761) + Last(31748).
        let records = vec![
            big_record(1, 1000),
            big_record(2, 97270),
            big_record(3, 8000),
        ];
        let data = write_records(&records);

        // 1000 + 97270 + 8000 payload bytes plus four headers and the
        // trailer layout put the writer inside the fourth block.
        assert!(data.len() > 3 * BLOCK_SIZE);

        let reporter = CollectingReporter::default();
        let mut reader = reader_over(data, reporter.clone());
        assert_eq!(read_all(&mut reader), records);
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn trailer_too_small_for_header_is_padded() {
        // Leave exactly HEADER_SIZE - 1 bytes in the first block.
        let n = BLOCK_SIZE - 2 * HEADER_SIZE + 1;
        let records = vec![big_record(9, n), b"tail".to_vec()];
        let reporter = CollectingReporter::default();
        let mut reader = reader_over(write_records(&records), reporter.clone());
        assert_eq!(read_all(&mut reader), records);
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn corrupt_middle_record_is_skipped() {
        let records = vec![big_record(1, 1000), big_record(2, 1000), big_record(3, 1000)];
        let mut data = write_records(&records);

        // Flip one byte in the middle record's payload.
        let second_payload_start = 2 * HEADER_SIZE + 1000 + 500;
        data[second_payload_start] ^= 0xff;

        let reporter = CollectingReporter::default();
        let mut reader = reader_over(data, reporter.clone());
        let got = read_all(&mut reader);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], records[0]);
        assert_eq!(got[1], records[2]);

        let drops = reporter.drops.lock().unwrap();
        assert_eq!(drops.len(), 1);
        assert!(drops[0].0 >= 1000, "dropped {} bytes", drops[0].0);
        assert_eq!(drops[0].1, "checksum mismatch");
    }

    #[test]
    fn truncated_tail_is_not_corruption() {
        let records = vec![b"complete".to_vec(), big_record(5, 600)];
        let mut data = write_records(&records);
        // Chop the last record mid-payload.
        data.truncate(data.len() - 300);

        let reporter = CollectingReporter::default();
        let mut reader = reader_over(data, reporter.clone());
        let got = read_all(&mut reader);
        assert_eq!(got, vec![b"complete".to_vec()]);
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn bad_length_is_reported() {
        let records = vec![b"first".to_vec(), b"second".to_vec()];
        let mut data = write_records(&records);
        // Claim the first record is longer than the block holds. Pad the
        // file to a full block so EOF handling does not kick in.
        data[4] = 0xff;
        data[5] = 0x7f;
        data.resize(BLOCK_SIZE, 0);

        let reporter = CollectingReporter::default();
        let mut reader = reader_over(data, reporter.clone());
        assert!(read_all(&mut reader).is_empty());

        let drops = reporter.drops.lock().unwrap();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].1, "bad record length");
    }

    #[test]
    fn unknown_record_type_is_reported() {
        let records = vec![b"known".to_vec()];
        let mut data = write_records(&records);
        data[6] = MAX_RECORD_TYPE + 1;
        // Fix the checksum so only the type is wrong... except the checksum
        // covers the type byte, so leave it: the reader reports the checksum
        // first when verification is on. Disable verification to reach the
        // type check.
        let mut reader = Reader::new(
            MemSequentialFile::new(data),
            Some(Box::new(CollectingReporter::default())),
            false,
            0,
        );
        assert!(reader.read_record().is_none());
    }

    #[test]
    fn initial_offset_skips_earlier_records() {
        let records = vec![big_record(1, 100), big_record(2, 200), big_record(3, 300)];
        let data = write_records(&records);

        // Start just past the first record's header byte 0.
        let reporter = CollectingReporter::default();
        let mut reader = Reader::new(
            MemSequentialFile::new(data),
            Some(Box::new(reporter.clone())),
            true,
            1,
        );
        let got = read_all(&mut reader);
        assert_eq!(got, &records[1..]);
        // Skipped prefix damage is never reported.
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn initial_offset_into_fragmented_record_resyncs() {
        // One huge fragmented record, then a small one. Starting inside the
        // huge record must silently skip its Middle/Last fragments.
        let records = vec![big_record(7, 3 * BLOCK_SIZE), b"after".to_vec()];
        let data = write_records(&records);

        let reporter = CollectingReporter::default();
        let mut reader = Reader::new(
            MemSequentialFile::new(data),
            Some(Box::new(reporter.clone())),
            true,
            (BLOCK_SIZE + 100) as u64,
        );
        let got = read_all(&mut reader);
        assert_eq!(got, vec![b"after".to_vec()]);
        assert!(reporter.drops.lock().unwrap().is_empty());
    }

    #[test]
    fn last_record_offset_tracks_first_fragment() {
        let records = vec![big_record(1, 10), big_record(2, 2 * BLOCK_SIZE)];
        let data = write_records(&records);

        let mut reader = reader_over(data, CollectingReporter::default());
        reader.read_record().unwrap();
        assert_eq!(reader.last_record_offset(), 0);
        reader.read_record().unwrap();
        // The second record begins right after the first one.
        assert_eq!(reader.last_record_offset(), (HEADER_SIZE + 10) as u64);
    }

    #[test]
    fn reopened_writer_continues_block_accounting() {
        let mut file = MemFile::new();
        {
            let mut writer = Writer::new(&mut file);
            writer.append_record(&big_record(1, BLOCK_SIZE - 1000)).unwrap();
        }
        let len = file.data.len() as u64;
        {
            let mut writer = Writer::with_length(&mut file, len);
            writer.append_record(&big_record(2, 5000)).unwrap();
        }

        let mut reader = reader_over(file.data, CollectingReporter::default());
        let got = read_all(&mut reader);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], big_record(1, BLOCK_SIZE - 1000));
        assert_eq!(got[1], big_record(2, 5000));
    }
}
