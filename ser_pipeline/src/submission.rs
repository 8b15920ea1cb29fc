use std::path::{Path, PathBuf};

use ser_ml::emotion_classifier::inference::Prediction;

const LABEL_COLUMN: &str = "label";
const PROBS_COLUMN: &str = "probs";

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("CSV error for {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Submission template {path:?} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("Got {predictions} predictions for a template with {rows} rows")]
    RowMismatch { predictions: usize, rows: usize },
}

/// Fill in the `label` and `probs` columns of the `template` CSV and write the result to `output`.
///
/// Predictions are matched to template rows by position. All other columns are copied as-is.
#[tracing::instrument(skip(predictions), fields(predictions = predictions.len()))]
pub fn write_submission(template: &Path, output: &Path, predictions: &[Prediction]) -> Result<usize, SubmissionError> {
    let csv_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: csv::Error| SubmissionError::Csv { path, source }
    };

    let mut reader = csv::Reader::from_path(template).map_err(csv_err(template))?;
    let mut headers = reader.headers().map_err(csv_err(template))?.clone();
    let records = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(csv_err(template))?;

    if records.len() != predictions.len() {
        return Err(SubmissionError::RowMismatch {
            predictions: predictions.len(),
            rows: records.len(),
        });
    }

    let label_idx = headers
        .iter()
        .position(|h| h == LABEL_COLUMN)
        .ok_or_else(|| SubmissionError::MissingColumn {
            path: template.to_path_buf(),
            column: LABEL_COLUMN,
        })?;
    let probs_idx = match headers.iter().position(|h| h == PROBS_COLUMN) {
        Some(idx) => idx,
        None => {
            headers.push_field(PROBS_COLUMN);
            headers.len() - 1
        }
    };

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SubmissionError::Csv {
            path: output.to_path_buf(),
            source: e.into(),
        })?;
    }

    let mut writer = csv::Writer::from_path(output).map_err(csv_err(output))?;
    writer.write_record(&headers).map_err(csv_err(output))?;

    for (record, prediction) in records.iter().zip(predictions) {
        let label = prediction.label.to_string();
        let probs = prediction.probs_string();
        let row = (0..headers.len()).map(|idx| match idx {
            i if i == label_idx => label.as_str(),
            i if i == probs_idx => probs.as_str(),
            i => record.get(i).unwrap_or(""),
        });

        writer.write_record(row).map_err(csv_err(output))?;
    }

    writer.flush().map_err(|e| SubmissionError::Csv {
        path: output.to_path_buf(),
        source: e.into(),
    })?;

    tracing::info!(?output, rows = records.len(), "Wrote submission");
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn prediction(label: usize) -> Prediction {
        let mut probabilities = vec![0.0; 6];
        probabilities[label] = 1.0;
        Prediction { label, probabilities }
    }

    #[test]
    #[traced_test]
    fn fills_label_and_appends_probs() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let template = dir.path().join("sample_submission.csv");
        let output = dir.path().join("out").join("submission.csv");
        std::fs::write(&template, "id,label\nTEST_0000,0\nTEST_0001,0\n")?;

        let rows = write_submission(&template, &output, &[prediction(3), prediction(5)])?;
        assert_eq!(rows, 2);

        let written = std::fs::read_to_string(&output)?;
        let lines = written.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "id,label,probs");
        assert_eq!(
            lines[1],
            "TEST_0000,3,\"[0.0000, 0.0000, 0.0000, 1.0000, 0.0000, 0.0000]\""
        );
        assert!(lines[2].starts_with("TEST_0001,5,"));
        assert!(logs_contain("Wrote submission"));
        Ok(())
    }

    #[test]
    fn overwrites_existing_probs_column() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let template = dir.path().join("sample_submission.csv");
        let output = dir.path().join("submission.csv");
        std::fs::write(&template, "id,probs,label\nTEST_0000,old,0\n")?;

        write_submission(&template, &output, &[prediction(1)])?;

        let mut reader = csv::Reader::from_path(&output)?;
        assert_eq!(reader.headers()?.iter().collect::<Vec<_>>(), vec!["id", "probs", "label"]);
        let record = reader.records().next().unwrap()?;
        assert_eq!(&record[2], "1");
        assert!(record[1].starts_with("[0.0000, 1.0000"));
        Ok(())
    }

    #[test]
    fn row_count_must_match() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let template = dir.path().join("sample_submission.csv");
        std::fs::write(&template, "id,label\nTEST_0000,0\nTEST_0001,0\n")?;

        let err = write_submission(&template, &dir.path().join("out.csv"), &[prediction(0)]).unwrap_err();
        assert!(matches!(err, SubmissionError::RowMismatch { predictions: 1, rows: 2 }));
        Ok(())
    }

    #[test]
    fn template_needs_a_label_column() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let template = dir.path().join("sample_submission.csv");
        std::fs::write(&template, "id,emotion\nTEST_0000,0\n")?;

        let err = write_submission(&template, &dir.path().join("out.csv"), &[prediction(0)]).unwrap_err();
        assert!(matches!(err, SubmissionError::MissingColumn { column: LABEL_COLUMN, .. }));
        Ok(())
    }
}
