//! Proof-of-stake reward schedule.

use crate::money::{Amount, CENT};

/// Annual stake interest, roughly 1%: 33 cents per 33 coin-years plus the
/// 8-day leap correction.
pub fn proof_of_stake_reward(coin_age_days: u64) -> Amount {
    let coin_age_days = coin_age_days as i64;
    coin_age_days * 33 * CENT / (365 * 33 + 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::COIN;

    #[test]
    fn one_coin_year_is_about_one_percent() {
        // 100 coins held one year accrue 36,500 coin-days.
        let reward = proof_of_stake_reward(36_500);
        assert!(reward > 99 * CENT && reward < 101 * CENT, "reward = {reward}");
        assert!(reward < COIN);
    }

    #[test]
    fn zero_age_zero_reward() {
        assert_eq!(proof_of_stake_reward(0), 0);
    }
}
