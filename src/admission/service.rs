use std::{
    mem,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use tower::Service;

use super::{Attributes, Controller};
use crate::Error as CrateError;

/// Claims before every call and releases with the inner result.
///
/// Admission errors are returned as the service error, so callers can
/// downcast to [`AdmissionError`](super::AdmissionError) to tell a
/// rejection apart from an inner failure.
#[derive(Clone, Debug)]
pub struct FairnessService<S, F> {
    inner: S,
    controller: Controller,
    attributes: F,
}

impl<S, F> FairnessService<S, F> {
    pub fn new(inner: S, controller: Controller, attributes: F) -> Self {
        Self {
            inner,
            controller,
            attributes,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, F, Req> Service<Req> for FairnessService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    S::Error: Into<CrateError>,
    F: Fn(&Req) -> Attributes,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = CrateError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        let attributes = (self.attributes)(&request);
        let controller = self.controller.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let permit = controller.claim(attributes).await?;
            match inner.call(request).await {
                Ok(response) => {
                    permit.succeed();
                    Ok(response)
                }
                Err(error) => {
                    let error: CrateError = error.into();
                    permit.fail(&error);
                    Err(error)
                }
            }
        })
    }
}
