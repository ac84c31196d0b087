use std::sync::Arc;

use arrow::array::{RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use loan_collapse::{LinkageLookup, LinkageMap};
use parquet::arrow::ArrowWriter;

use crate::utils::temp_dir;

#[test]
fn text_map_loads_pipe_separated_pairs() {
    let dir = temp_dir("links-text");
    let path = dir.join("Loan_Mapping.txt");
    std::fs::write(&path, "A1|B1\n\nA2|B2\n").unwrap();

    let map = LinkageMap::from_delimited(&path).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.forward("A2"), Some("B2"));
    assert_eq!(map.backward("B1"), Some("A1"));
    assert_eq!(map.forward("B1"), None);
}

#[test]
fn text_map_rejects_a_loan_mapped_twice() {
    let dir = temp_dir("links-dup");
    let path = dir.join("dup.txt");
    std::fs::write(&path, "A1|B1\nA1|B2\n").unwrap();
    assert!(LinkageMap::from_delimited(&path).unwrap_err().is_config());
}

#[tokio::test]
async fn parquet_map_reads_the_two_id_columns() {
    let dir = temp_dir("links-parquet");
    let path = dir.join("links.parquet");
    let schema = Arc::new(Schema::new(vec![
        Field::new("note", DataType::Utf8, true),
        Field::new("oldLnId", DataType::Utf8, false),
        Field::new("harpLnId", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(StringArray::from(vec![Some("x"), None])),
            Arc::new(StringArray::from(vec!["A1", "A2"])),
            Arc::new(StringArray::from(vec!["B1", "B2"])),
        ],
    )
    .unwrap();
    let mut writer = ArrowWriter::try_new(std::fs::File::create(&path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let map = LinkageMap::from_parquet(&path).await.unwrap();
    let link = map.resolve("B2");
    assert_eq!(link.backward.as_deref(), Some("A2"));
    assert_eq!(link.forward, None);
}
