use std::sync::Arc;
use std::time::Duration;

use crate::api::ExchangeApi;
use crate::execution::CandleBuffer;
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::Result;

/// Periodically reloads candle history for every enabled market
pub struct CandleRefresher {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn Store>,
    candles: CandleBuffer,
    history: u32,
    interval: Duration,
}

impl CandleRefresher {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn Store>,
        candles: CandleBuffer,
        history: u32,
        interval: Duration,
    ) -> Self {
        Self {
            exchange,
            store,
            candles,
            history,
            interval,
        }
    }

    /// Refresh all enabled markets once. Returns how many were refreshed.
    pub async fn refresh_once(&self) -> Result<usize> {
        let configs = self.store.strategy_configs().await?;
        let mut refreshed = 0;

        for config in configs.iter().filter(|c| c.enabled) {
            let fetched = match self
                .exchange
                .get_candles(&config.market, &config.timeframe.path(), self.history)
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    tracing::warn!("Candle refresh failed for {}: {}", config.market, e);
                    continue;
                }
            };

            if let Err(e) = self.candles.replace(&config.market, fetched.clone()) {
                tracing::warn!("Candle buffer replace failed for {}: {}", config.market, e);
                continue;
            }
            self.store.save_candles(&fetched).await?;

            tracing::debug!("Refreshed {} candles for {}", fetched.len(), config.market);
            refreshed += 1;
        }

        Ok(refreshed)
    }

    /// Refresh every `interval`; the first refresh happens one interval in
    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            if shutdown.sleep_or_shutdown(self.interval).await {
                break;
            }
            match self.refresh_once().await {
                Ok(count) => tracing::debug!("Candle refresh done for {} markets", count),
                Err(e) => tracing::warn!("Candle refresh failed: {}", e),
            }
        }
        tracing::info!("Candle refresher stopped");
    }
}
