use std::io::{Cursor, Write as IoWrite};

use serde_json::Value;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::AppError;

pub const EXPORT_HEADERS: &[&str] = &[
    "Name",
    "Email",
    "Phone",
    "Status",
    "Role",
    "Total Orders",
    "Total Spent",
    "Last Order",
    "Registered",
];

// Columns rendered as numbers in the workbook (0-based).
const NUMERIC_COLUMNS: &[usize] = &[5, 6];

/// One spreadsheet row per user, in header order. Both export formats feed
/// from here so the tuples always agree.
pub fn export_cells(row: &Value) -> Vec<String> {
    vec![
        value_str(row, "name"),
        value_str(row, "email"),
        value_str(row, "phone"),
        value_str(row, "actual_status"),
        value_str(row, "role"),
        row.get("total_orders")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .to_string(),
        format!(
            "{:.2}",
            row.get("total_amount_spent")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        ),
        date_part(&value_str(row, "last_order")),
        date_part(&value_str(row, "created_at")),
    ]
}

/// UTF-8 CSV with a BOM so spreadsheet apps pick up the encoding.
pub fn users_csv(rows: &[Value]) -> String {
    let mut csv = String::from("\u{feff}");
    csv.push_str(
        &EXPORT_HEADERS
            .iter()
            .map(|header| csv_escape(header))
            .collect::<Vec<_>>()
            .join(","),
    );
    csv.push('\n');
    for row in rows {
        let cells = export_cells(row);
        csv.push_str(
            &cells
                .iter()
                .map(|cell| csv_escape(cell))
                .collect::<Vec<_>>()
                .join(","),
        );
        csv.push('\n');
    }
    csv
}

/// A minimal but valid .xlsx: a zip archive of the standard XML parts with
/// one worksheet, inline strings and a bold header row.
pub fn users_workbook(rows: &[Value]) -> Result<Vec<u8>, AppError> {
    let mut buffer = Vec::new();
    {
        let mut archive = ZipWriter::new(Cursor::new(&mut buffer));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        write_part(&mut archive, "[Content_Types].xml", CONTENT_TYPES_XML, options)?;
        write_part(&mut archive, "_rels/.rels", ROOT_RELS_XML, options)?;
        write_part(&mut archive, "xl/workbook.xml", WORKBOOK_XML, options)?;
        write_part(
            &mut archive,
            "xl/_rels/workbook.xml.rels",
            WORKBOOK_RELS_XML,
            options,
        )?;
        write_part(&mut archive, "xl/styles.xml", STYLES_XML, options)?;
        write_part(
            &mut archive,
            "xl/worksheets/sheet1.xml",
            &sheet_xml(rows),
            options,
        )?;

        archive
            .finish()
            .map_err(|error| AppError::Internal(format!("Could not finish workbook: {error}")))?;
    }
    Ok(buffer)
}

fn write_part(
    archive: &mut ZipWriter<Cursor<&mut Vec<u8>>>,
    name: &str,
    content: &str,
    options: SimpleFileOptions,
) -> Result<(), AppError> {
    archive
        .start_file(name, options)
        .map_err(|error| AppError::Internal(format!("Could not write workbook part: {error}")))?;
    archive
        .write_all(content.as_bytes())
        .map_err(|error| AppError::Internal(format!("Could not write workbook part: {error}")))?;
    Ok(())
}

fn sheet_xml(rows: &[Value]) -> String {
    use std::fmt::Write;

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">",
    );
    let _ = write!(
        xml,
        "<cols><col min=\"1\" max=\"{}\" width=\"20\" customWidth=\"1\"/></cols><sheetData>",
        EXPORT_HEADERS.len()
    );

    let _ = write!(xml, "<row r=\"1\">");
    for (index, header) in EXPORT_HEADERS.iter().enumerate() {
        let _ = write!(
            xml,
            "<c r=\"{}1\" s=\"1\" t=\"inlineStr\"><is><t>{}</t></is></c>",
            column_ref(index),
            xml_escape(header)
        );
    }
    let _ = write!(xml, "</row>");

    for (row_index, row) in rows.iter().enumerate() {
        let row_number = row_index + 2;
        let _ = write!(xml, "<row r=\"{row_number}\">");
        for (column, cell) in export_cells(row).iter().enumerate() {
            let reference = format!("{}{row_number}", column_ref(column));
            if NUMERIC_COLUMNS.contains(&column) && cell.parse::<f64>().is_ok() {
                let _ = write!(xml, "<c r=\"{reference}\"><v>{cell}</v></c>");
            } else {
                let _ = write!(
                    xml,
                    "<c r=\"{reference}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                    xml_escape(cell)
                );
            }
        }
        let _ = write!(xml, "</row>");
    }

    xml.push_str("</sheetData></worksheet>");
    xml
}

fn column_ref(index: usize) -> char {
    (b'A' + index as u8) as char
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn value_str(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn date_part(timestamp: &str) -> String {
    timestamp.get(..10).unwrap_or(timestamp).to_string()
}

const CONTENT_TYPES_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
<Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
<Default Extension=\"xml\" ContentType=\"application/xml\"/>\
<Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>\
<Override PartName=\"/xl/worksheets/sheet1.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>\
<Override PartName=\"/xl/styles.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml\"/>\
</Types>";

const ROOT_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
</Relationships>";

const WORKBOOK_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
<sheets><sheet name=\"Users\" sheetId=\"1\" r:id=\"rId1\"/></sheets>\
</workbook>";

const WORKBOOK_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet1.xml\"/>\
<Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles\" Target=\"styles.xml\"/>\
</Relationships>";

const STYLES_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<styleSheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">\
<fonts count=\"2\"><font><sz val=\"11\"/><name val=\"Calibri\"/></font><font><b/><sz val=\"11\"/><name val=\"Calibri\"/></font></fonts>\
<fills count=\"2\"><fill><patternFill patternType=\"none\"/></fill><fill><patternFill patternType=\"gray125\"/></fill></fills>\
<borders count=\"1\"><border/></borders>\
<cellStyleXfs count=\"1\"><xf/></cellStyleXfs>\
<cellXfs count=\"2\"><xf xfId=\"0\" fontId=\"0\"/><xf xfId=\"0\" fontId=\"1\" applyFont=\"1\"/></cellXfs>\
</styleSheet>";

#[cfg(test)]
mod tests {
    use super::{export_cells, users_csv, users_workbook, EXPORT_HEADERS};
    use serde_json::json;
    use std::io::Read;

    fn sample_rows() -> Vec<serde_json::Value> {
        vec![
            json!({
                "name": "Asha Verma",
                "email": "asha@example.com",
                "phone": "+91-9000000001",
                "actual_status": "ACTIVE",
                "role": "customer",
                "total_orders": 4,
                "total_amount_spent": 7249.5,
                "last_order": "2025-05-20T14:05:00+00:00",
                "created_at": "2024-11-02T09:00:00+00:00",
            }),
            json!({
                "name": "Rao, Kiran \"KK\"",
                "email": "kiran@example.com",
                "phone": "",
                "actual_status": "INACTIVE",
                "role": "customer",
                "total_orders": 0,
                "total_amount_spent": 0.0,
                "last_order": serde_json::Value::Null,
                "created_at": "2025-01-15T10:30:00+00:00",
            }),
        ]
    }

    #[test]
    fn csv_starts_with_bom_and_header() {
        let csv = users_csv(&sample_rows());
        assert!(csv.starts_with('\u{feff}'));
        let header_line = csv.trim_start_matches('\u{feff}').lines().next().expect("header");
        assert_eq!(header_line, EXPORT_HEADERS.join(","));
    }

    #[test]
    fn csv_quotes_fields_with_commas_and_doubles_quotes() {
        let csv = users_csv(&sample_rows());
        assert!(
            csv.contains("\"Rao, Kiran \"\"KK\"\"\""),
            "expected quoted+doubled field, got: {csv}"
        );
        assert!(csv.contains("7249.50"));
        assert!(csv.contains("2025-05-20"));
    }

    #[test]
    fn workbook_is_a_zip_with_the_standard_parts() {
        let bytes = users_workbook(&sample_rows()).expect("workbook builds");
        assert!(bytes.starts_with(b"PK"));

        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("workbook reopens");
        for part in [
            "[Content_Types].xml",
            "_rels/.rels",
            "xl/workbook.xml",
            "xl/_rels/workbook.xml.rels",
            "xl/styles.xml",
            "xl/worksheets/sheet1.xml",
        ] {
            assert!(
                archive.by_name(part).is_ok(),
                "missing workbook part {part}"
            );
        }
    }

    #[test]
    fn sheet_rows_match_csv_tuples() {
        let rows = sample_rows();
        let bytes = users_workbook(&rows).expect("workbook builds");
        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("workbook reopens");
        let mut sheet = String::new();
        archive
            .by_name("xl/worksheets/sheet1.xml")
            .expect("sheet part")
            .read_to_string(&mut sheet)
            .expect("sheet reads");

        // Header row is styled bold.
        assert!(sheet.contains("<c r=\"A1\" s=\"1\" t=\"inlineStr\"><is><t>Name</t></is></c>"));
        for cell in export_cells(&rows[0]) {
            let escaped = cell
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('"', "&quot;")
                .replace('\'', "&apos;");
            assert!(
                sheet.contains(&escaped) || sheet.contains(&format!("<v>{cell}</v>")),
                "cell value {cell} missing from sheet"
            );
        }
    }

    #[test]
    fn spend_column_renders_as_number_cell() {
        let bytes = users_workbook(&sample_rows()).expect("workbook builds");
        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("workbook reopens");
        let mut sheet = String::new();
        archive
            .by_name("xl/worksheets/sheet1.xml")
            .expect("sheet part")
            .read_to_string(&mut sheet)
            .expect("sheet reads");
        assert!(sheet.contains("<c r=\"G2\"><v>7249.50</v></c>"), "got: {sheet}");
    }
}
