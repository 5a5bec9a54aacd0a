// Tests for the append-only per-entity writer

use runweb_core::output::{EntityWriter, RecordReader, entity_file_name, parse_line};
use std::fs;
use tempfile::TempDir;

const HEADER: &[&str] = &["game", "user", "related_game"];

#[test]
fn test_header_written_once_across_reopens() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("raw").join(entity_file_name(0, "Some Game"));

    {
        let mut writer = EntityWriter::open(&path, HEADER).unwrap();
        writer.append_row(&["g1", "u1", "g2"]).unwrap();
        assert_eq!(writer.rows_written(), 1);
    }
    {
        let mut writer = EntityWriter::open(&path, HEADER).unwrap();
        writer.append_row(&["g1", "u2", "g3"]).unwrap();
    }

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content, "game,user,related_game\ng1,u1,g2\ng1,u2,g3\n");
}

#[test]
fn test_existing_content_is_a_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("0_x.csv");

    let mut writer = EntityWriter::open(&path, HEADER).unwrap();
    let mut snapshots = Vec::new();
    for i in 0..5 {
        let user = format!("u{}", i);
        writer.append_row(&["g1", user.as_str(), "g2"]).unwrap();
        snapshots.push(fs::read_to_string(&path).unwrap());
    }

    for pair in snapshots.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
        assert!(pair[1].len() > pair[0].len());
    }
}

#[test]
fn test_unterminated_last_line_is_repaired() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("0_x.csv");
    fs::write(&path, "game,user,related_game\ng1,u1,g2").unwrap();

    let mut writer = EntityWriter::open(&path, HEADER).unwrap();
    writer.append_row(&["g1", "u2", "g3"]).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content, "game,user,related_game\ng1,u1,g2\ng1,u2,g3\n");
}

#[test]
fn test_torn_quoted_field_is_closed_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("0_x.csv");
    fs::write(&path, "game,user,related_game\ng1,u0,g9\n\"Game, On").unwrap();

    let mut writer = EntityWriter::open(&path, HEADER).unwrap();
    writer.append_row(&["g1", "u2", "g3"]).unwrap();
    writer.append_row(&["g1", "u3", "g4"]).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("game,user,related_game\ng1,u0,g9\n\"Game, On"));

    let rows: Vec<_> = RecordReader::open(&path)
        .unwrap()
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[2], vec!["Game, On"]);
    assert_eq!(rows[3], vec!["g1", "u2", "g3"]);
    assert_eq!(rows[4], vec!["g1", "u3", "g4"]);
}

#[test]
fn test_torn_multiline_field_is_closed_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("0_x.csv");
    fs::write(&path, "game,user,related_game\ng1,u0,\"two\n").unwrap();

    let mut writer = EntityWriter::open(&path, HEADER).unwrap();
    writer.append_row(&["g1", "u2", "g3"]).unwrap();

    let rows: Vec<_> = RecordReader::open(&path)
        .unwrap()
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1], vec!["g1", "u0", "two\n"]);
    assert_eq!(rows[2], vec!["g1", "u2", "g3"]);
}

#[test]
fn test_awkward_fields_survive_a_read_back() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("0_x.csv");

    let mut writer = EntityWriter::open(&path, HEADER).unwrap();
    writer
        .append_row(&["Game, The", "say \"hi\"", "two\nlines"])
        .unwrap();

    let rows: Vec<_> = RecordReader::open(&path)
        .unwrap()
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], vec!["Game, The", "say \"hi\"", "two\nlines"]);
}

#[test]
fn test_parse_line_plain() {
    assert_eq!(parse_line("g1,u1,g2,c1,,3"), vec!["g1", "u1", "g2", "c1", "", "3"]);
}

#[test]
fn test_entity_file_names() {
    assert_eq!(entity_file_name(3, "Mario Kart: Double Dash!!"), "3_Mario_Kart_Double_Dash!!.csv");
    assert_eq!(entity_file_name(0, "A/B?"), "0_AB.csv");
}
