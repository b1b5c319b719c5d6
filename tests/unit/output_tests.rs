//! Unit tests for output line handling.

use std::sync::Arc;

use term_supervisor::supervisor::output::{
    default_noise_prefixes, run_output_watcher, LineAssembler, LinePiece, LineSplitter,
    OutputSettings, MAX_PENDING_BYTES,
};
use term_supervisor::supervisor::OutputStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn settings(max_line_bytes: usize) -> OutputSettings {
    OutputSettings {
        max_line_bytes,
        ..OutputSettings::default()
    }
}

/// A short line passes through unchanged.
#[test]
fn short_line_is_one_record() {
    let records = settings(4096).records_for_line(OutputStream::Stdout, "listening on 4020");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text, "listening on 4020");
    assert!(records[0].chunk.is_none());
    assert_eq!(records[0].to_string(), "listening on 4020");
}

/// An oversized line becomes ordered chunks that concatenate to the original.
#[test]
fn long_line_is_chunked_in_order() {
    let line: String = ('a'..='z').cycle().take(35).collect();
    let records = settings(10).records_for_line(OutputStream::Stderr, &line);

    assert_eq!(records.len(), 4);
    for (i, record) in records.iter().enumerate() {
        let marker = record.chunk.expect("chunk marker");
        assert_eq!(marker.index, i + 1);
        assert_eq!(marker.total, Some(4));
        assert_eq!(record.stream, OutputStream::Stderr);
        assert!(record.text.len() <= 10);
    }

    let joined: String = records.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(joined, line);
    assert!(records[0].to_string().starts_with("[chunk 1/4] "));
}

/// Chunking never splits a multi-byte character.
#[test]
fn chunking_keeps_utf8_intact() {
    let line = "日本語のログ行".repeat(20);
    let records = settings(16).records_for_line(OutputStream::Stdout, &line);
    assert!(records.len() > 1);
    let joined: String = records.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(joined, line);
}

/// Shell banners and blank lines are dropped.
#[test]
fn noise_lines_are_dropped() {
    let settings = OutputSettings::default();
    for line in [
        "Last login: Mon Jan  1 10:00:00 on ttys001",
        "Restored session: Tue",
        "Saving session...",
        "  ...completed.",
        "",
        "   ",
    ] {
        assert!(
            settings.records_for_line(OutputStream::Stdout, line).is_empty(),
            "expected noise: {line:?}"
        );
    }
    assert_eq!(default_noise_prefixes().len(), 7);
}

/// Lines that only mention a noise prefix later on are kept.
#[test]
fn noise_must_be_a_prefix() {
    let records = OutputSettings::default()
        .records_for_line(OutputStream::Stdout, "user said Last login: was wrong");
    assert_eq!(records.len(), 1);
}

/// Lines split across reads are reassembled.
#[test]
fn splitter_reassembles_lines() {
    let mut splitter = LineSplitter::new();
    assert!(splitter.push(b"first ").is_empty());
    assert_eq!(
        splitter.push(b"line\nsecond\r\nthi"),
        vec![LinePiece::line("first line"), LinePiece::line("second")]
    );
    assert_eq!(splitter.finish(), Some(LinePiece::line("thi")));
}

/// A line outgrowing the pending buffer is flushed at a character boundary
/// and finished by the piece that carries its newline.
#[test]
fn splitter_flushes_oversized_line_on_char_boundary() {
    let mut splitter = LineSplitter::new();
    let mut input = "a".repeat(MAX_PENDING_BYTES - 1).into_bytes();
    input.extend_from_slice("€tail\n".as_bytes());

    let pieces = splitter.push(&input);
    assert_eq!(pieces.len(), 2);
    assert!(!pieces[0].complete);
    assert_eq!(pieces[0].text.len(), MAX_PENDING_BYTES - 1);
    assert_eq!(pieces[1], LinePiece::line("€tail"));
}

/// Pieces of one line are numbered continuously; the closing piece knows the total.
#[test]
fn assembler_numbers_chunks_across_pieces() {
    let settings = settings(4);
    let mut assembler = LineAssembler::new(OutputStream::Stdout);

    let first = assembler.records(
        &settings,
        &LinePiece {
            text: "abcdefgh".to_owned(),
            complete: false,
        },
    );
    let last = assembler.records(&settings, &LinePiece::line("ijk"));

    let markers: Vec<_> = first.iter().chain(&last).filter_map(|r| r.chunk).collect();
    let indices: Vec<_> = markers.iter().map(|m| m.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(markers[0].total, None);
    assert_eq!(markers[2].total, Some(3));
    assert_eq!(first[0].to_string(), "[chunk 1/?] abcd");

    // The next line starts afresh.
    let next = assembler.records(&settings, &LinePiece::line("ok"));
    assert_eq!(next.len(), 1);
    assert!(next[0].chunk.is_none());
}

/// A noisy line that gets flushed in pieces is dropped as a whole.
#[test]
fn assembler_drops_every_piece_of_a_noise_line() {
    let settings = settings(4);
    let mut assembler = LineAssembler::new(OutputStream::Stdout);
    let head = LinePiece {
        text: "Last login: somewhere".to_owned(),
        complete: false,
    };
    assert!(assembler.records(&settings, &head).is_empty());
    assert!(assembler.records(&settings, &LinePiece::line("more")).is_empty());
    assert_eq!(assembler.records(&settings, &LinePiece::line("kept")).len(), 1);
}

/// More than a mebibyte of three-byte characters on one line comes out intact,
/// in order, and with one continuous chunk numbering.
#[tokio::test]
async fn watcher_keeps_oversized_multibyte_line_intact() {
    let line = "€".repeat(MAX_PENDING_BYTES / 3 + 10);
    let input = format!("{line}\n");
    let settings = Arc::new(OutputSettings::default());
    let max_line_bytes = settings.max_line_bytes;
    let (tx, mut rx) = mpsc::channel(4096);

    run_output_watcher(
        7,
        OutputStream::Stdout,
        input.as_bytes(),
        settings,
        Some(tx),
        CancellationToken::new(),
    )
    .await;

    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }

    let joined: String = records.iter().map(|r| r.text.as_str()).collect();
    assert!(!joined.contains('\u{FFFD}'));
    assert_eq!(joined, line);

    let total = records.len();
    for (i, record) in records.iter().enumerate() {
        let marker = record.chunk.expect("chunk marker");
        assert_eq!(marker.index, i + 1);
        assert!(marker.total.is_none() || marker.total == Some(total));
        assert!(record.text.len() <= max_line_bytes);
    }
    assert_eq!(records.last().and_then(|r| r.chunk).and_then(|m| m.total), Some(total));
}
