//! CSV bodies for tag export.

use ualink_core::types::TagExportRecord;

pub const CSV_HEADER: [&str; 5] = ["NodeID", "Name", "DataType", "Description", "Path"];

/// Renders tag records as CSV with a fixed header row.
pub fn tags_to_csv(records: &[TagExportRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.write_record([
            &record.node_id,
            &record.name,
            &record.data_type,
            &record.description,
            &record.path,
        ])?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}
