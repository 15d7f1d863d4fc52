use crate::common::*;

/// A row in the dataset CSV file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CsvSample {
    pub pid: String,
    pub fid: String,
}

/// The identity-labeled image dataset.
///
/// Records keep the order of the CSV file. Identities are indexed densely in the
/// order of their first occurrence.
#[derive(Debug, Clone)]
pub struct ReidDataset {
    image_root: PathBuf,
    samples: Vec<CsvSample>,
    labels: Vec<usize>,
    identities: IndexMap<String, Vec<usize>>,
}

impl ReidDataset {
    /// Load the `(pid, fid)` CSV file without header.
    ///
    /// If `fail_on_missing` is set, the loading fails when any image file is not found
    /// under `image_root`.
    pub fn load(
        csv_file: impl AsRef<Path>,
        image_root: impl AsRef<Path>,
        fail_on_missing: bool,
    ) -> Result<Self> {
        let csv_file = csv_file.as_ref();
        let image_root = image_root.as_ref();

        let samples: Vec<CsvSample> = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(csv_file)
            .with_context(|| format!("failed to open dataset file {}", csv_file.display()))?
            .into_deserialize()
            .map(|result| -> Result<_> { Ok(result?) })
            .try_collect()
            .with_context(|| format!("failed to parse dataset file {}", csv_file.display()))?;

        let dataset = Self::from_samples(image_root, samples)?;

        if fail_on_missing {
            let missing: Vec<_> = dataset
                .samples
                .iter()
                .filter(|sample| !image_root.join(&sample.fid).is_file())
                .collect();

            if let Some(first) = missing.first() {
                bail!(
                    "{} of {} images are missing, for example {}",
                    missing.len(),
                    dataset.len(),
                    image_root.join(&first.fid).display()
                );
            }
        }

        Ok(dataset)
    }

    pub fn from_samples(image_root: impl AsRef<Path>, samples: Vec<CsvSample>) -> Result<Self> {
        ensure!(!samples.is_empty(), "the dataset is empty");

        let mut identities: IndexMap<String, Vec<usize>> = IndexMap::new();
        let labels: Vec<usize> = samples
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                let entry = identities.entry(sample.pid.clone());
                let label = entry.index();
                entry.or_default().push(index);
                label
            })
            .collect();

        Ok(Self {
            image_root: image_root.as_ref().to_owned(),
            samples,
            labels,
            identities,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    pub fn samples(&self) -> &[CsvSample] {
        &self.samples
    }

    /// The identity index of each record.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn num_identities(&self) -> usize {
        self.identities.len()
    }

    pub fn pid(&self, identity: usize) -> Option<&str> {
        self.identities
            .get_index(identity)
            .map(|(pid, _)| pid.as_str())
    }

    /// Record indexes belonging to the identity.
    pub fn records_of(&self, identity: usize) -> &[usize] {
        self.identities
            .get_index(identity)
            .map(|(_, records)| records.as_slice())
            .unwrap_or(&[])
    }

    /// The first record of each identity, in identity order.
    pub fn first_records(&self) -> Vec<usize> {
        self.identities
            .values()
            .map(|records| records[0])
            .collect()
    }

    pub fn image_path(&self, record: usize) -> PathBuf {
        self.image_root.join(&self.samples[record].fid)
    }

    /// The byte length of the longest file ID.
    pub fn max_fid_len(&self) -> usize {
        self.samples
            .iter()
            .map(|sample| sample.fid.len())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("reid-dl-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn load_csv_dataset() -> Result<()> {
        let dir = temp_dir()?;
        fs::write(
            dir.join("train.csv"),
            "0002,a/0002_c1.jpg\n0007,a/0007_c2.jpg\n0002,a/0002_c3.jpg\n",
        )?;
        fs::create_dir_all(dir.join("a"))?;
        for name in ["0002_c1.jpg", "0007_c2.jpg", "0002_c3.jpg"] {
            fs::write(dir.join("a").join(name), b"")?;
        }

        let dataset = ReidDataset::load(dir.join("train.csv"), &dir, true)?;
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.num_identities(), 2);
        assert_eq!(dataset.labels(), &[0, 1, 0]);
        assert_eq!(dataset.pid(1), Some("0007"));
        assert_eq!(dataset.records_of(0), &[0, 2]);
        assert_eq!(dataset.first_records(), vec![0, 1]);
        assert_eq!(dataset.image_path(1), dir.join("a/0007_c2.jpg"));
        assert_eq!(dataset.max_fid_len(), 13);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn missing_images_are_fatal() -> Result<()> {
        let dir = temp_dir()?;
        fs::write(dir.join("train.csv"), "1,x.jpg\n2,y.jpg\n")?;
        fs::write(dir.join("x.jpg"), b"")?;

        assert!(ReidDataset::load(dir.join("train.csv"), &dir, true).is_err());
        let dataset = ReidDataset::load(dir.join("train.csv"), &dir, false)?;
        assert_eq!(dataset.len(), 2);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
