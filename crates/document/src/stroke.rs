use std::sync::Arc;

use model::{NodeId, Rect, UpdateFlags};
use parking_lot::Mutex;
use scheduler::{JobContext, JobError, StrokeJob, StrokeStrategy};
use tiles::{TiledDataManager, Transaction};

use crate::image::Image;
use crate::updates::ImageUpdater;
use crate::DocumentError;

/// Fills rects of one paint layer. Cancelling the stroke puts back the
/// layer content it had when the stroke began.
pub struct FillStroke {
    layer: NodeId,
    device: Arc<TiledDataManager>,
    updater: ImageUpdater,
    transaction: Mutex<Option<Transaction>>,
    touched: Mutex<Rect>,
}

impl FillStroke {
    pub fn new(image: &Image, layer: NodeId) -> Result<Arc<Self>, DocumentError> {
        Ok(Arc::new(Self {
            layer,
            device: image.paint_device(layer)?,
            updater: image.updater(),
            transaction: Mutex::new(None),
            touched: Mutex::new(Rect::empty()),
        }))
    }

    pub fn layer(&self) -> NodeId {
        self.layer
    }

    /// A job filling `rect` with `pixel`.
    pub fn job(self: &Arc<Self>, rect: Rect, pixel: &[u8]) -> Box<dyn StrokeJob> {
        Box::new(FillJob {
            stroke: self.clone(),
            rect,
            pixel: pixel.into(),
        })
    }

    fn touch(&self, rect: Rect) {
        let mut touched = self.touched.lock();
        *touched = touched.united(&rect);
    }
}

impl StrokeStrategy for FillStroke {
    fn name(&self) -> &str {
        "fill"
    }

    fn begin(&self, _context: &JobContext) -> Result<(), JobError> {
        *self.transaction.lock() = Some(Transaction::begin(&self.device));
        Ok(())
    }

    fn end(&self, _context: &JobContext) -> Result<(), JobError> {
        if let Some(transaction) = self.transaction.lock().take() {
            transaction.commit();
        }
        Ok(())
    }

    fn cancel(&self, context: &JobContext) -> Result<(), JobError> {
        let Some(transaction) = self.transaction.lock().take() else {
            tracing::debug!(job = context.job_id().0, "fill cancelled before it began");
            return Ok(());
        };
        transaction.revert();
        let touched = std::mem::replace(&mut *self.touched.lock(), Rect::empty());
        self.updater
            .request_projection_update(self.layer, touched, UpdateFlags::empty());
        Ok(())
    }
}

struct FillJob {
    stroke: Arc<FillStroke>,
    rect: Rect,
    pixel: Box<[u8]>,
}

impl StrokeJob for FillJob {
    fn region(&self) -> Option<Rect> {
        Some(self.rect)
    }

    fn run(&mut self, context: &JobContext) -> Result<(), JobError> {
        if context.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let stroke = &self.stroke;
        if self.pixel.len() != stroke.device.pixel_size() {
            return Err(JobError::Failed(format!(
                "fill pixel has {} bytes, layer pixels have {}",
                self.pixel.len(),
                stroke.device.pixel_size()
            )));
        }
        stroke.device.fill(self.rect, &self.pixel);
        stroke.touch(self.rect);
        stroke
            .updater
            .request_projection_update(stroke.layer, self.rect, UpdateFlags::empty());
        Ok(())
    }
}
