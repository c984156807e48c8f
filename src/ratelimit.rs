use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use nonzero_ext::nonzero;
use std::{num::NonZeroU32, time::Duration};

// The portal is a single old JSP server; stay well below anything it would notice.
const DEFAULT_REQ_PER_SEC: NonZeroU32 = nonzero!(5u32);
const MS_BETWEEN_REQ: Duration = Duration::from_millis(100);

pub struct RateLimiter {
    req_per_sec: DefaultDirectRateLimiter,
    ms_between_req: DefaultDirectRateLimiter,
}

impl RateLimiter {
    pub fn new(req_per_sec: u32) -> Self {
        let per_sec = NonZeroU32::new(req_per_sec).unwrap_or(DEFAULT_REQ_PER_SEC);

        // Limit to X total req/sec on average.
        let req_per_sec = GovernorRateLimiter::direct(Quota::per_second(per_sec));

        // No two requests closer than Y ms.
        let period = Quota::with_period(MS_BETWEEN_REQ).unwrap_or(Quota::per_second(per_sec));
        let ms_between_req = GovernorRateLimiter::direct(period);

        RateLimiter {
            req_per_sec,
            ms_between_req,
        }
    }

    pub async fn wait_until_ready(&self) {
        // Order matters: the per-second budget first, then the spacing check,
        // so a burst that clears the budget still gets serialised.
        self.req_per_sec.until_ready().await;
        self.ms_between_req.until_ready().await;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQ_PER_SEC.get())
    }
}
