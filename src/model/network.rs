//! Full network assembly and batch tensor construction.

use tch::{nn, Device, Tensor};

use super::branch::BranchEncoder;
use super::fusion::{FusionHeads, HeadOutputs, Label};
use super::vision::{ImageLoader, VisionEncoder};
use super::ModelDims;
use crate::encoder::{EncodedField, EncodedRecord};
use crate::error::{DemographerError, Result};
use crate::model_loader::ModelVariant;

/// One text field of a batch: `[batch, capacity]` indices and row lengths.
#[derive(Debug)]
pub struct FieldBatch {
    pub indices: Tensor,
    pub lengths: Vec<usize>,
}

impl FieldBatch {
    fn new<'a, I>(fields: I, device: Device) -> Result<Self>
    where
        I: ExactSizeIterator<Item = &'a EncodedField>,
    {
        let rows = fields.len();
        let mut capacity = None;
        let mut flat = Vec::new();
        let mut lengths = Vec::with_capacity(rows);

        for field in fields {
            match capacity {
                None => capacity = Some(field.capacity()),
                Some(cap) if cap != field.capacity() => {
                    return Err(DemographerError::Shape(format!(
                        "mixed field capacities {} and {} in one batch",
                        cap,
                        field.capacity()
                    )))
                }
                Some(_) => {}
            }
            flat.extend_from_slice(field.indices());
            lengths.push(field.valid_length());
        }

        let capacity = capacity.unwrap_or(0) as i64;
        let indices = Tensor::from_slice(&flat)
            .view([rows as i64, capacity])
            .to_device(device);
        Ok(Self { indices, lengths })
    }
}

/// Tensors for one forward pass.
#[derive(Debug)]
pub struct BatchInput {
    pub lang: Tensor,
    pub username: FieldBatch,
    pub screen_name: FieldBatch,
    pub description: FieldBatch,
    /// `[batch, 3, 224, 224]`, present when the batch was built with images.
    pub images: Option<Tensor>,
}

impl BatchInput {
    /// Stack encoded records onto `device`.
    ///
    /// With an [`ImageLoader`] the image batch is built too, using its
    /// placeholder for records without an image.
    pub fn from_encoded(
        records: &[EncodedRecord],
        images: Option<&ImageLoader>,
        device: Device,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(DemographerError::Shape("empty batch".to_string()));
        }

        let lang: Vec<i64> = records.iter().map(|r| r.language_id).collect();
        let images = match images {
            Some(loader) => {
                let paths: Vec<_> = records.iter().map(|r| r.image.as_deref()).collect();
                Some(loader.batch(&paths, device)?)
            }
            None => None,
        };

        Ok(Self {
            lang: Tensor::from_slice(&lang).to_device(device),
            username: FieldBatch::new(records.iter().map(|r| &r.username), device)?,
            screen_name: FieldBatch::new(records.iter().map(|r| &r.screen_name), device)?,
            description: FieldBatch::new(records.iter().map(|r| &r.description), device)?,
            images,
        })
    }

    pub fn len(&self) -> usize {
        self.username.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Username, screen name and description branches, the vision branch for
/// [`ModelVariant::Full`], and the fusion heads.
#[derive(Debug)]
pub struct DemographicModel {
    variant: ModelVariant,
    username: BranchEncoder,
    screen_name: BranchEncoder,
    description: BranchEncoder,
    vision: Option<VisionEncoder>,
    heads: FusionHeads,
}

impl DemographicModel {
    pub fn new(root: &nn::Path, variant: ModelVariant, dims: &ModelDims) -> Self {
        let vision = if variant.uses_image() {
            Some(VisionEncoder::new(root, dims.vision_out))
        } else {
            None
        };

        DemographicModel {
            variant,
            username: BranchEncoder::new(root, "username", dims.char_branch()),
            screen_name: BranchEncoder::new(root, "screenname", dims.ascii_branch()),
            description: BranchEncoder::new(root, "des", dims.char_branch()),
            vision,
            heads: FusionHeads::new(root, dims.fusion_input(variant.uses_image()), dims.merge),
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    fn branches(&self, input: &BatchInput) -> Result<Vec<Tensor>> {
        let mut outputs = vec![
            self.username
                .forward(&input.lang, &input.username.indices, &input.username.lengths)?,
            self.screen_name.forward(
                &input.lang,
                &input.screen_name.indices,
                &input.screen_name.lengths,
            )?,
            self.description.forward(
                &input.lang,
                &input.description.indices,
                &input.description.lengths,
            )?,
        ];

        if let Some(vision) = &self.vision {
            let images = input.images.as_ref().ok_or_else(|| {
                DemographerError::Shape(format!("{} needs an image batch", self.variant))
            })?;
            outputs.push(vision.forward(images));
        }
        Ok(outputs)
    }

    /// All three distributions for the batch, rows in input order.
    pub fn forward(&self, input: &BatchInput) -> Result<HeadOutputs> {
        Ok(self.heads.forward(&self.branches(input)?))
    }

    pub fn forward_label(&self, input: &BatchInput, label: Label) -> Result<Tensor> {
        Ok(self.heads.forward_label(&self.branches(input)?, label))
    }
}
