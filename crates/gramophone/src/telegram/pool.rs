use std::num::NonZeroU32;
use std::ops::Deref;
use std::sync::Arc;

use governor::{Quota, RateLimiter};

use super::TelegramError;
use super::client::Bot;
use crate::config::ProxyConfig;

/// Global send-side budget shared by every session in the pool.
const SEND_RATE: NonZeroU32 = NonZeroU32::new(25).unwrap();

/// A fixed set of persistent API sessions. Each checkout picks the
/// session with the fewest requests in flight.
pub struct Pool {
    bots: Vec<Arc<Bot>>,
}

impl Pool {
    pub fn new(
        token: &str,
        size: usize,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self, TelegramError> {
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(SEND_RATE)));
        let bots = (0..size.max(1))
            .map(|_| Bot::new(token, proxy, limiter.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { bots })
    }

    pub fn checkout(&self) -> Session {
        let bot = self
            .bots
            .iter()
            .min_by_key(|bot| bot.load())
            .expect("pool is never empty")
            .clone();
        bot.begin();
        Session { bot }
    }
}

/// A checked-out session; dropping it returns the load slot.
pub struct Session {
    bot: Arc<Bot>,
}

impl Deref for Session {
    type Target = Bot;

    fn deref(&self) -> &Bot {
        &self.bot
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.bot.finish();
    }
}
