use std::sync::Arc;

use crate::AdmissionId;
use crate::RateLimitController;

/// An admission borrowed from a [`RateLimitController`].
///
/// The admission is released when the permit is dropped, whether the work it
/// guarded finished, failed, panicked or was cancelled.
#[derive(Debug)]
#[must_use = "dropping a permit releases the admission immediately"]
pub struct AdmissionPermit<'a> {
    controller: &'a RateLimitController,
    id: AdmissionId,
}

impl<'a> AdmissionPermit<'a> {
    pub(crate) fn new(controller: &'a RateLimitController, id: AdmissionId) -> Self {
        Self { controller, id }
    }

    pub fn id(&self) -> AdmissionId {
        self.id
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.controller.end_admission(self.id);
    }
}

/// An admission that keeps its [`RateLimitController`] alive.
///
/// Use this where the permit has to travel with a `'static` future, such as
/// a tower response future.
#[derive(Debug)]
#[must_use = "dropping a permit releases the admission immediately"]
pub struct OwnedAdmissionPermit {
    controller: Arc<RateLimitController>,
    id: AdmissionId,
}

impl OwnedAdmissionPermit {
    pub(crate) fn new(controller: Arc<RateLimitController>, id: AdmissionId) -> Self {
        Self { controller, id }
    }

    pub fn id(&self) -> AdmissionId {
        self.id
    }

    pub fn controller(&self) -> &Arc<RateLimitController> {
        &self.controller
    }
}

impl Drop for OwnedAdmissionPermit {
    fn drop(&mut self) {
        self.controller.end_admission(self.id);
    }
}
