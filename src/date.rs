//! Cached HTTP date values.
//!
//! Formatting an RFC 1123 date on every `100 Continue` prelude is wasted
//! work under load; a background task refreshes a shared string instead.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use httpdate::fmt_http_date;

const REFRESH_INTERVAL: Duration = Duration::from_millis(700);

/// Maintains the current RFC 1123 date string, refreshed in the
/// background. Dropping the service stops the refresher.
pub(crate) struct DateService {
    current: Arc<ArcSwap<String>>,
    handle: tokio::task::JoinHandle<()>,
}

impl DateService {
    pub(crate) fn new() -> Self {
        let current = Arc::new(ArcSwap::from_pointee(fmt_http_date(SystemTime::now())));

        let shared = Arc::clone(&current);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                shared.store(Arc::new(fmt_http_date(SystemTime::now())));
            }
        });

        DateService { current, handle }
    }

    pub(crate) fn http_date(&self) -> Arc<String> {
        self.current.load_full()
    }
}

impl Drop for DateService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_a_plausible_http_date() {
        let service = DateService::new();
        let date = service.http_date();

        assert!(date.ends_with(" GMT"));
        assert!(httpdate::parse_http_date(&date).is_ok());
    }
}
