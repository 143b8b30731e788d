use std::future::Future;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use tracing::debug;

use crate::AdmissionId;
use crate::AdmissionPermit;
use crate::ControllerError;
use crate::RateLimitController;

/// Spreads work over interchangeable resources, each behind its own
/// [`RateLimitController`].
///
/// A typical resource is an API key with its own quota. Every acquisition
/// picks a resource at random, weighted by the rate of its controller, and
/// then waits for admission on that controller alone. The pick is not
/// revisited while waiting, so a busy resource is not traded for an idle one.
#[derive(Debug)]
pub struct ResourceScheduler<R> {
    resources: Vec<(R, RateLimitController)>,
    weights: WeightedIndex<usize>,
    rng: Mutex<StdRng>,
}

impl<R> ResourceScheduler<R> {
    pub fn new(resources: Vec<(R, RateLimitController)>) -> Result<Self, ControllerError> {
        let rates = resources.iter().map(|(_, controller)| controller.rate());
        let weights = WeightedIndex::new(rates).map_err(|_| ControllerError::NoResources)?;

        Ok(Self {
            resources,
            weights,
            rng: Mutex::new(StdRng::from_os_rng()),
        })
    }

    /// Seeds the resource picker, making the sequence of picks reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn resources(&self) -> impl Iterator<Item = (&R, &RateLimitController)> {
        self.resources
            .iter()
            .map(|(resource, controller)| (resource, controller))
    }

    fn choose(&self) -> usize {
        self.weights.sample(&mut *self.rng.lock())
    }

    /// Picks a resource and waits for admission on its controller.
    pub async fn acquire(&self) -> ScheduledPermit<'_, R> {
        let index = self.choose();
        let (resource, controller) = &self.resources[index];
        let permit = controller.acquire().await;
        debug!(resource = index, id = permit.id().get(), "resource admitted");

        ScheduledPermit {
            index,
            resource,
            permit,
        }
    }

    /// Runs `work` with a scheduled resource, releasing the admission when
    /// `work` completes.
    pub async fn run<'a, F, Fut>(&'a self, work: F) -> Fut::Output
    where
        F: FnOnce(&'a R) -> Fut,
        Fut: Future,
    {
        let permit = self.acquire().await;
        work(permit.resource()).await
    }
}

/// An admission on one resource of a [`ResourceScheduler`].
#[derive(Debug)]
#[must_use = "dropping a permit releases the admission immediately"]
pub struct ScheduledPermit<'a, R> {
    index: usize,
    resource: &'a R,
    permit: AdmissionPermit<'a>,
}

impl<'a, R> ScheduledPermit<'a, R> {
    pub fn resource(&self) -> &'a R {
        self.resource
    }

    /// Position of the resource in the scheduler's list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> AdmissionId {
        self.permit.id()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use more_asserts::assert_gt;

    use super::*;

    fn controller(rate: usize) -> RateLimitController {
        RateLimitController::new(NonZeroUsize::new(rate).unwrap(), Duration::ZERO)
    }

    #[test]
    fn it_needs_a_resource() {
        let outcome = ResourceScheduler::<&str>::new(vec![]);
        assert_eq!(outcome.err(), Some(ControllerError::NoResources));
    }

    #[tokio::test]
    async fn it_prefers_resources_with_higher_rates() {
        let resources = vec![("slow", controller(1)), ("fast", controller(3))];
        let scheduler = ResourceScheduler::new(resources)
            .unwrap()
            .with_seed(0xDEF1_BABE);

        let mut picks = [0usize; 2];
        for _ in 0..400 {
            let permit = scheduler.acquire().await;
            picks[permit.index()] += 1;
        }

        assert_eq!(picks[0] + picks[1], 400);
        assert_gt!(picks[0], 0);
        assert_gt!(picks[1], picks[0] * 2);
    }

    #[tokio::test]
    async fn it_admits_on_the_chosen_resource() {
        let scheduler = ResourceScheduler::new(vec![("only", controller(1))]).unwrap();

        let held = scheduler.acquire().await;
        assert_eq!(*held.resource(), "only");

        let mut next = Box::pin(scheduler.acquire());
        assert!(futures::poll!(next.as_mut()).is_pending());

        drop(held);
        let next = next.await;
        assert_eq!(next.id().get(), 1);

        let (_, only) = scheduler.resources().next().unwrap();
        assert_eq!(only.in_flight(), 1);
    }

    #[tokio::test]
    async fn run_hands_the_resource_to_the_work() {
        let scheduler =
            ResourceScheduler::new(vec![("key-a".to_string(), controller(2))]).unwrap();

        let len = scheduler.run(|key| async move { key.len() }).await;
        assert_eq!(len, 5);

        let (_, only) = scheduler.resources().next().unwrap();
        assert_eq!(only.in_flight(), 0);
        assert_eq!(only.admitted(), 1);
    }
}
