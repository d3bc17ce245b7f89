use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use seqjournal::{ErrorKind, Journal, JournalConfig, Position, Whence};
use tempfile::tempdir;

#[test]
fn ten_small_records_rotate_at_least_once() {
    let dir = tempdir().expect("tempdir");
    let mut journal = Journal::new(dir.path());
    journal
        .init(JournalConfig { unit_limit: 40, ..JournalConfig::default() })
        .expect("init");
    journal.open_writer().expect("open writer");

    for _ in 0..10 {
        journal.write(b"12345678").expect("append");
    }

    assert!(journal.last_log_id().expect("last log id") >= 1);
}

#[test]
fn corrupted_header_is_repaired_and_surviving_records_stay_in_order() {
    let dir = tempdir().expect("tempdir");
    let mut journal = Journal::new(dir.path());
    journal.init(JournalConfig::default()).expect("init");
    journal.open_writer().expect("open writer");
    journal.write(b"aaaa").expect("append a");
    let second = journal.write(b"bbbb").expect("append b");
    journal.write(b"cccc").expect("append c");
    journal.add_subscriber("s", Whence::Begin).expect("add subscriber");

    // Flip one byte of the second record's header magic to desync the index.
    let segment_path = dir.path().join("00000000");
    {
        let mut file = OpenOptions::new().write(true).open(&segment_path).expect("open segment");
        let record_offset = (16 + 4) as u64 * (second.marker as u64 - 1);
        file.seek(SeekFrom::Start(record_offset)).expect("seek");
        file.write_all(&[0xFF]).expect("corrupt a byte");
    }

    let removed = journal.repair_segment(0).expect("repair");
    assert!(removed >= 1);

    let mut reader = Journal::new(dir.path());
    reader.init(JournalConfig::default()).expect("init reader");
    reader.open_reader("s").expect("open reader");

    let mut start = Position::ZERO;
    let mut finish = Position::ZERO;
    reader.read_interval(&mut start, &mut finish).expect("interval");

    let mut payloads = Vec::new();
    let mut marker = start.marker;
    while marker <= finish.marker {
        let view = reader.read_message(Position::new(start.log, marker)).expect("read");
        payloads.push(view.payload.to_vec());
        marker += 1;
    }
    assert_eq!(payloads, vec![b"aaaa".to_vec(), b"cccc".to_vec()]);
}

#[test]
fn ctx_repair_recreates_deleted_metastore() {
    let dir = tempdir().expect("tempdir");
    let mut journal = Journal::new(dir.path());
    journal.init(JournalConfig::default()).expect("init");
    journal.open_writer().expect("open writer");
    journal.write(b"x").expect("append");
    journal.close();

    std::fs::remove_file(dir.path().join("metastore")).expect("remove metastore");

    let mut repairer = Journal::new(dir.path());
    repairer.repair(false).expect("repair");

    assert!(dir.path().join("metastore").exists());
    assert_eq!(repairer.last_log_id().expect("last"), 0);

    let mut reopened = Journal::new(dir.path());
    reopened.init(JournalConfig::default()).expect("reinit after repair");
    reopened.open_writer().expect("resume writing after repair");
    let next = reopened.write(b"y").expect("append after repair");
    assert_eq!(next, Position::new(0, 2));
}

#[test]
fn subscriber_added_at_end_sees_nothing_until_next_write() {
    let dir = tempdir().expect("tempdir");
    let mut journal = Journal::new(dir.path());
    journal.init(JournalConfig::default()).expect("init");
    journal.open_writer().expect("open writer");
    journal.write(b"prior").expect("append");
    journal.add_subscriber("x", Whence::End).expect("add at end");

    let mut reader = Journal::new(dir.path());
    reader.init(JournalConfig::default()).expect("init reader");
    reader.open_reader("x").expect("open reader");

    let mut start = Position::ZERO;
    let mut finish = Position::ZERO;
    let count = reader.read_interval(&mut start, &mut finish).expect("interval");
    assert_eq!(count, 0);
}

#[test]
fn writing_a_zero_length_record_round_trips() {
    let dir = tempdir().expect("tempdir");
    let mut journal = Journal::new(dir.path());
    journal.init(JournalConfig::default()).expect("init");
    journal.open_writer().expect("open writer");
    journal.write(b"").expect("append empty");
    journal.add_subscriber("s", Whence::Begin).expect("add subscriber");

    let mut reader = Journal::new(dir.path());
    reader.init(JournalConfig::default()).expect("init reader");
    reader.open_reader("s").expect("open reader");

    let mut start = Position::ZERO;
    let mut finish = Position::ZERO;
    assert_eq!(reader.read_interval(&mut start, &mut finish).expect("interval"), 1);
    let view = reader.read_message(start).expect("read");
    assert!(view.payload.is_empty());
}

#[test]
fn reading_past_a_closed_segments_last_record_returns_close_logid() {
    let dir = tempdir().expect("tempdir");
    let mut journal = Journal::new(dir.path());
    journal
        .init(JournalConfig { unit_limit: 10, ..JournalConfig::default() })
        .expect("init");
    journal.open_writer().expect("open writer");
    journal.write(b"12345678").expect("append, overflows unit_limit and rotates");
    journal.write(b"next segment").expect("append into new segment");
    journal.add_subscriber("s", Whence::Begin).expect("add subscriber");

    let mut reader = Journal::new(dir.path());
    reader.init(JournalConfig::default()).expect("init reader");
    reader.open_reader("s").expect("open reader");

    let err = reader.read_message(Position::new(0, 2)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::CloseLogId);
}
