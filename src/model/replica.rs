//! Data-parallel execution over identical model replicas.
//!
//! A batch is split into contiguous sub-batches of near-equal size, one per
//! replica. Each replica runs on its own scoped thread and the outputs are
//! concatenated in sub-batch order. A set with one replica runs inline.

use std::path::Path;
use std::thread;

use tch::{nn, Device, Tensor};
use tracing::{debug, info};

use super::fusion::{HeadOutputs, Label};
use super::network::{BatchInput, DemographicModel};
use super::vision::ImageLoader;
use super::ModelDims;
use crate::encoder::EncodedRecord;
use crate::error::{DemographerError, Result};
use crate::model_loader::{load_state_dict, ModelVariant};

/// One copy of the parameters on one device.
#[derive(Debug)]
pub struct Replica {
    vs: nn::VarStore,
    model: DemographicModel,
}

impl Replica {
    pub fn new(variant: ModelVariant, dims: &ModelDims, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let model = DemographicModel::new(&vs.root(), variant, dims);
        Replica { vs, model }
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn model(&self) -> &DemographicModel {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn input(&self, records: &[EncodedRecord], images: Option<&ImageLoader>) -> Result<BatchInput> {
        let images = if self.model.variant().uses_image() {
            Some(images.ok_or_else(|| {
                DemographerError::Config("the full model needs an image loader".to_string())
            })?)
        } else {
            None
        };
        BatchInput::from_encoded(records, images, self.device())
    }

    /// All three distributions for `records`, on the CPU.
    pub fn forward(
        &self,
        records: &[EncodedRecord],
        images: Option<&ImageLoader>,
    ) -> Result<HeadOutputs> {
        let input = self.input(records, images)?;
        Ok(self.model.forward(&input)?.to_device(Device::Cpu))
    }

    /// One distribution for `records`, on the CPU.
    pub fn forward_label(
        &self,
        records: &[EncodedRecord],
        images: Option<&ImageLoader>,
        label: Label,
    ) -> Result<Tensor> {
        let input = self.input(records, images)?;
        Ok(self.model.forward_label(&input, label)?.to_device(Device::Cpu))
    }
}

/// Replicas holding identical, frozen parameters.
#[derive(Debug)]
pub struct ReplicaSet {
    replicas: Vec<Replica>,
    variant: ModelVariant,
}

impl ReplicaSet {
    /// Build one replica per entry of `devices`.
    ///
    /// The first replica loads the state dict at `checkpoint` when given,
    /// otherwise it keeps its random initialisation. Every other replica copies its parameters.
    pub fn build(
        variant: ModelVariant,
        dims: &ModelDims,
        devices: &[Device],
        checkpoint: Option<&Path>,
    ) -> Result<Self> {
        let (&first_device, rest) = devices.split_first().ok_or_else(|| {
            DemographerError::Config("a replica set needs at least one device".to_string())
        })?;

        let mut first = Replica::new(variant, dims, first_device);
        if let Some(path) = checkpoint {
            info!(path = %path.display(), device = ?first_device, "loading checkpoint");
            load_state_dict(&first.vs, path)?;
        }

        let mut replicas = Vec::with_capacity(devices.len());
        for &device in rest {
            let mut replica = Replica::new(variant, dims, device);
            replica.vs.copy(&first.vs)?;
            replicas.push(replica);
        }
        replicas.insert(0, first);

        for replica in &mut replicas {
            replica.vs.freeze();
        }
        info!(variant = %variant, replicas = replicas.len(), "model ready");

        Ok(ReplicaSet { replicas, variant })
    }

    /// Devices for a replica set.
    ///
    /// Without `parallel` this is a single device. With it, CUDA runs one
    /// replica per visible GPU and the CPU runs `replicas` copies (default 1).
    pub fn devices(use_cuda: bool, parallel: bool, replicas: Option<usize>) -> Vec<Device> {
        let gpus = if use_cuda && tch::Cuda::is_available() {
            tch::Cuda::device_count().max(0) as usize
        } else {
            0
        };

        match (gpus, parallel) {
            (0, false) => vec![Device::Cpu],
            (0, true) => vec![Device::Cpu; replicas.unwrap_or(1).max(1)],
            (_, false) => vec![Device::Cuda(0)],
            (gpus, true) => (0..replicas.unwrap_or(gpus).max(1))
                .map(|i| Device::Cuda(i % gpus))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn devices_in_use(&self) -> Vec<Device> {
        self.replicas.iter().map(Replica::device).collect()
    }

    pub fn primary(&self) -> &Replica {
        &self.replicas[0]
    }

    /// Run all heads over `records`. Rows come back in input order.
    pub fn run(
        &mut self,
        records: &[EncodedRecord],
        images: Option<&ImageLoader>,
    ) -> Result<HeadOutputs> {
        let parts = self.scatter(records, |replica, chunk| replica.forward(chunk, images))?;
        Ok(HeadOutputs::cat(&parts))
    }

    pub fn run_label(
        &mut self,
        records: &[EncodedRecord],
        images: Option<&ImageLoader>,
        label: Label,
    ) -> Result<Tensor> {
        let parts = self.scatter(records, |replica, chunk| {
            replica.forward_label(chunk, images, label)
        })?;
        Ok(Tensor::cat(&parts, 0))
    }

    fn scatter<T, F>(&mut self, records: &[EncodedRecord], task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&Replica, &[EncodedRecord]) -> Result<T> + Sync,
    {
        if records.is_empty() {
            return Err(DemographerError::Shape("empty batch".to_string()));
        }

        let sizes = split_sizes(records.len(), self.replicas.len());
        if sizes.len() == 1 {
            return Ok(vec![tch::no_grad(|| task(&self.replicas[0], records))?]);
        }

        let mut chunks = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for size in sizes {
            chunks.push(&records[start..start + size]);
            start += size;
        }
        debug!(chunks = chunks.len(), records = records.len(), "scattering batch");

        let task = &task;
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .replicas
                .iter_mut()
                .zip(chunks)
                .map(|(replica, chunk)| {
                    scope.spawn(move || tch::no_grad(|| task(&*replica, chunk)))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

/// Sizes of `parts` contiguous chunks covering `total` items, larger chunks
/// first and differing by at most one. Never yields an empty chunk.
pub fn split_sizes(total: usize, parts: usize) -> Vec<usize> {
    let parts = parts.min(total).max(1);
    let base = total / parts;
    let extra = total % parts;
    (0..parts)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use std::sync::Arc;

    use crate::encoder::FeatureEncoder;
    use crate::model_loader::{file_md5, CheckpointSpec, ModelResolver, ResolutionState};
    use crate::record::ProfileRecord;
    use crate::vocab::tests::sample_vocab;
    use tch::Kind;

    fn encoded(n: usize) -> Vec<EncodedRecord> {
        let encoder = FeatureEncoder::new(Arc::new(sample_vocab()));
        let records: Vec<_> = (0..n)
            .map(|i| {
                ProfileRecord::new(
                    i.to_string(),
                    if i % 2 == 0 { "en" } else { "es" },
                    "x".repeat(1 + i * 3),
                    format!("user{}", i),
                    "a b c ".repeat(i),
                )
            })
            .collect();
        encoder.encode_batch(&records, false)
    }

    #[test]
    fn test_split_sizes() {
        assert_eq!(split_sizes(8, 2), vec![4, 4]);
        assert_eq!(split_sizes(7, 3), vec![3, 2, 2]);
        assert_eq!(split_sizes(2, 4), vec![1, 1]);
        assert_eq!(split_sizes(5, 1), vec![5]);
        assert_eq!(split_sizes(3, 0), vec![3]);
    }

    #[test]
    fn test_replicas_share_parameters() {
        tch::manual_seed(21);
        let set = ReplicaSet::build(
            ModelVariant::Text,
            &ModelDims::tiny(),
            &[Device::Cpu, Device::Cpu],
            None,
        )
        .unwrap();
        assert_eq!(set.len(), 2);

        let first = set.replicas[0].var_store().variables();
        let second = set.replicas[1].var_store().variables();
        assert_eq!(first.len(), second.len());
        for (name, tensor) in &first {
            assert!(tensor.equal(&second[name]), "{} differs", name);
            assert!(!tensor.requires_grad());
        }
    }

    #[test]
    fn test_two_way_split_matches_single_replica() {
        let records = encoded(8);
        let dims = ModelDims::tiny();

        let mut single = ReplicaSet::build(ModelVariant::Text, &dims, &[Device::Cpu], None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("tiny.ot");
        single.primary().var_store().save(&checkpoint).unwrap();

        let devices = [Device::Cpu, Device::Cpu];
        let mut pair =
            ReplicaSet::build(ModelVariant::Text, &dims, &devices, Some(&checkpoint)).unwrap();

        let expected = single.run(&records, None).unwrap();
        let actual = pair.run(&records, None).unwrap();
        for label in Label::ALL {
            assert_eq!(actual.get(label).size()[0], 8);
            assert!(actual
                .get(label)
                .allclose(expected.get(label), 1e-5, 1e-5, false));
        }

        let age = pair.run_label(&records, None, Label::Age).unwrap();
        assert!(age.allclose(&expected.age, 1e-5, 1e-5, false));
    }

    /// Write `vs` the way `torch.save(model.state_dict())` does. Returns
    /// false when python3 with torch and numpy is not available.
    fn write_torch_state_dict(vs: &nn::VarStore, path: &Path) -> bool {
        let npz = path.with_extension("npz");
        let named: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
        if Tensor::write_npz(&named, &npz).is_err() {
            return false;
        }
        let script = "import sys, numpy, torch\n\
                      d = numpy.load(sys.argv[1])\n\
                      torch.save({k: torch.from_numpy(d[k]) for k in d.files}, sys.argv[2])\n";
        matches!(
            Command::new("python3").arg("-c").arg(script).arg(&npz).arg(path).status(),
            Ok(status) if status.success()
        )
    }

    #[test]
    fn test_pickled_checkpoint_resolves_and_loads() {
        let records = encoded(6);
        let dims = ModelDims::tiny();
        let mut source = ReplicaSet::build(ModelVariant::Text, &dims, &[Device::Cpu], None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.pt");
        if !write_torch_state_dict(source.primary().var_store(), &staged) {
            eprintln!("python3 with torch not available, skipping");
            return;
        }

        let spec = CheckpointSpec {
            name: ModelVariant::Text.name().to_string(),
            mirrors: Vec::new(),
            md5: file_md5(&staged).unwrap(),
        };
        let resolver = ModelResolver::new(dir.path().join("models")).with_auto_download(false);
        fs::create_dir_all(resolver.cache_dir()).unwrap();
        let cached = resolver.checkpoint_path(&spec);
        assert_eq!(cached.extension().unwrap(), "mdl");
        fs::rename(&staged, &cached).unwrap();

        let (report, result) = resolver.resolve_and_load(&spec, |path| {
            ReplicaSet::build(ModelVariant::Text, &dims, &[Device::Cpu, Device::Cpu], Some(path))
        });
        let mut loaded = result.unwrap();
        assert_eq!(report.last(), Some(&ResolutionState::Loaded));

        let expected = source.run(&records, None).unwrap();
        let actual = loaded.run(&records, None).unwrap();
        for label in Label::ALL {
            assert!(actual
                .get(label)
                .allclose(expected.get(label), 1e-5, 1e-5, false));
        }
    }

    #[test]
    fn test_checkpoint_missing_image_branch_is_rejected() {
        let dims = ModelDims::tiny();
        let text = ReplicaSet::build(ModelVariant::Text, &dims, &[Device::Cpu], None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("text.safetensors");
        text.primary().var_store().save(&checkpoint).unwrap();

        let err = ReplicaSet::build(ModelVariant::Full, &dims, &[Device::Cpu], Some(&checkpoint))
            .unwrap_err();
        assert!(matches!(err, DemographerError::Checkpoint(_)));
    }

    #[test]
    fn test_more_replicas_than_records() {
        tch::manual_seed(23);
        let devices = vec![Device::Cpu; 4];
        let mut set = ReplicaSet::build(ModelVariant::Text, &ModelDims::tiny(), &devices, None)
            .unwrap();
        let out = set.run(&encoded(3), None).unwrap();
        assert_eq!(out.org.size(), vec![3, 2]);
        assert_eq!(out.org.kind(), Kind::Float);
    }

    #[test]
    fn test_build_requires_a_device() {
        assert!(ReplicaSet::build(ModelVariant::Text, &ModelDims::tiny(), &[], None).is_err());
    }

    #[test]
    fn test_cpu_devices() {
        assert_eq!(ReplicaSet::devices(false, false, Some(3)), vec![Device::Cpu]);
        assert_eq!(ReplicaSet::devices(false, true, Some(3)).len(), 3);
        assert_eq!(ReplicaSet::devices(false, true, None), vec![Device::Cpu]);
    }
}
