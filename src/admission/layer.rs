use tower::Layer;

use super::{Controller, service::FairnessService};

/// Gates an inner service behind a [`Controller`].
///
/// `attributes` is a `Fn(&Req) -> Attributes` that derives the fairness attributes of each request; the inner
/// call's `Err` is reported as a failure.
#[derive(Clone, Debug)]
pub struct FairnessLayer<F> {
    controller: Controller,
    attributes: F,
}

impl<F> FairnessLayer<F> {
    pub fn new(controller: Controller, attributes: F) -> Self {
        Self {
            controller,
            attributes,
        }
    }
}

impl<S, F: Clone> Layer<S> for FairnessLayer<F> {
    type Service = FairnessService<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        FairnessService::new(inner, self.controller.clone(), self.attributes.clone())
    }
}
