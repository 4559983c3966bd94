//! Coin selection: the stochastic subset-sum selector, its greedy staking
//! sibling, and the coin-control override.

use std::collections::BTreeSet;

use rand::RngCore;
use umbra_consensus::{Amount, Hash256, CENT};
use umbra_primitives::outpoint::OutPoint;

/// One spendable output as the selector sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpendableOutput {
    pub txid: Hash256,
    pub vout: u32,
    pub value: Amount,
    pub depth: i32,
    pub from_me: bool,
    /// Creation time of the owning transaction; selection never spends
    /// coins from the future.
    pub tx_time: u32,
}

impl SpendableOutput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Randomness seam so the stochastic passes are reproducible under test.
pub trait SelectorRng {
    fn next_u64(&mut self) -> u64;

    fn flip(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }

    fn pick(&mut self, upper: usize) -> usize {
        if upper == 0 {
            0
        } else {
            (self.next_u64() % upper as u64) as usize
        }
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.pick(i + 1);
            items.swap(i, j);
        }
    }
}

/// OS-entropy randomness for production selection.
#[derive(Default)]
pub struct OsSelectorRng;

impl SelectorRng for OsSelectorRng {
    fn next_u64(&mut self) -> u64 {
        rand::rngs::OsRng.next_u64()
    }
}

/// Deterministic sequence for tests.
pub struct SeededSelectorRng {
    state: u64,
}

impl SeededSelectorRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }
}

impl SelectorRng for SeededSelectorRng {
    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }
}

/// Manual output pre-selection plus an optional fixed change destination.
#[derive(Clone, Debug, Default)]
pub struct CoinControl {
    selected: BTreeSet<OutPoint>,
    pub change_script: Option<Vec<u8>>,
}

impl CoinControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, outpoint: OutPoint) {
        self.selected.insert(outpoint);
    }

    pub fn unselect(&mut self, outpoint: &OutPoint) {
        self.selected.remove(outpoint);
    }

    pub fn unselect_all(&mut self) {
        self.selected.clear();
    }

    pub fn has_selection(&self) -> bool {
        !self.selected.is_empty()
    }

    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.selected.contains(outpoint)
    }

    pub fn list_selected(&self) -> Vec<OutPoint> {
        self.selected.iter().copied().collect()
    }
}

/// Stochastic knapsack: `iterations` random passes over the value list,
/// keeping the smallest total at or above target. Pass two of each round
/// only considers values pass one left out.
fn approximate_best_subset<R: SelectorRng>(
    rng: &mut R,
    values: &[(Amount, usize)],
    total_lower: Amount,
    target: Amount,
    iterations: usize,
) -> (Vec<bool>, Amount) {
    let mut best = vec![true; values.len()];
    let mut best_total = total_lower;

    let mut rep = 0;
    while rep < iterations && best_total != target {
        let mut included = vec![false; values.len()];
        let mut total: Amount = 0;
        let mut reached = false;
        for pass in 0..2 {
            if reached {
                break;
            }
            for i in 0..values.len() {
                let consider = if pass == 0 { rng.flip() } else { !included[i] };
                if !consider {
                    continue;
                }
                total += values[i].0;
                included[i] = true;
                if total >= target {
                    reached = true;
                    if total < best_total {
                        best_total = total;
                        best = included.clone();
                    }
                    total -= values[i].0;
                    included[i] = false;
                }
            }
        }
        rep += 1;
    }
    (best, best_total)
}

/// One tier of selection at fixed confirmation requirements. Mirrors the
/// classic selector: exact match wins immediately, a single larger coin is
/// the fallback, otherwise the stochastic approximation decides.
pub fn select_coins_min_conf<R: SelectorRng>(
    rng: &mut R,
    target: Amount,
    spend_time: u32,
    conf_mine: i32,
    conf_theirs: i32,
    coins: &[SpendableOutput],
) -> Option<(Vec<SpendableOutput>, Amount)> {
    let mut shuffled: Vec<&SpendableOutput> = coins.iter().collect();
    rng.shuffle(&mut shuffled);

    let mut lowest_larger: Option<&SpendableOutput> = None;
    let mut lower: Vec<&SpendableOutput> = Vec::new();
    let mut total_lower: Amount = 0;

    for output in shuffled {
        let required = if output.from_me { conf_mine } else { conf_theirs };
        if output.depth < required {
            continue;
        }
        if output.tx_time > spend_time {
            continue;
        }
        if output.value == target {
            return Some((vec![output.clone()], output.value));
        } else if output.value < target + CENT {
            lower.push(output);
            total_lower += output.value;
        } else if lowest_larger.map(|best| output.value < best.value).unwrap_or(true) {
            lowest_larger = Some(output);
        }
    }

    if total_lower == target {
        let selected: Vec<SpendableOutput> = lower.iter().map(|o| (*o).clone()).collect();
        return Some((selected, total_lower));
    }

    if total_lower < target {
        let larger = lowest_larger?;
        return Some((vec![larger.clone()], larger.value));
    }

    // Solve subset sum by stochastic approximation, largest values first.
    lower.sort_by(|a, b| b.value.cmp(&a.value));
    let values: Vec<(Amount, usize)> = lower
        .iter()
        .enumerate()
        .map(|(index, output)| (output.value, index))
        .collect();
    let (mut best, mut best_total) =
        approximate_best_subset(rng, &values, total_lower, target, 1000);
    if best_total != target && total_lower >= target + CENT {
        let (retry, retry_total) =
            approximate_best_subset(rng, &values, total_lower, target + CENT, 1000);
        best = retry;
        best_total = retry_total;
    }

    // Prefer the single larger coin when the approximation landed in the
    // sub-CENT overshoot band or the larger coin is cheaper outright.
    if let Some(larger) = lowest_larger {
        if (best_total != target && best_total < target + CENT) || larger.value <= best_total {
            return Some((vec![larger.clone()], larger.value));
        }
    }

    let mut selected = Vec::new();
    let mut selected_total: Amount = 0;
    for (index, include) in best.iter().enumerate() {
        if *include {
            selected.push(lower[index].clone());
            selected_total += lower[index].value;
        }
    }
    umbra_log::log_debug!(
        "selected {} coins totalling {selected_total} for target {target}",
        selected.len()
    );
    Some((selected, selected_total))
}

/// The full cascade: tight confirmation requirements first, loosening only
/// when selection fails outright.
pub fn select_coins<R: SelectorRng>(
    rng: &mut R,
    target: Amount,
    spend_time: u32,
    coins: &[SpendableOutput],
) -> Option<(Vec<SpendableOutput>, Amount)> {
    select_coins_min_conf(rng, target, spend_time, 1, 6, coins)
        .or_else(|| select_coins_min_conf(rng, target, spend_time, 1, 1, coins))
        .or_else(|| select_coins_min_conf(rng, target, spend_time, 0, 1, coins))
}

/// Greedy selector used by staking: no shuffle, no approximation. Callers
/// pass coins in ascending (txid, vout) order and the scan preserves it, so
/// staking behaviour is stable across runs.
pub fn select_coins_simple(
    target: Amount,
    spend_time: u32,
    coins: &[SpendableOutput],
) -> (Vec<SpendableOutput>, Amount) {
    let mut selected = Vec::new();
    let mut total: Amount = 0;
    for output in coins {
        if total >= target {
            break;
        }
        if output.tx_time > spend_time {
            continue;
        }
        if output.value >= target {
            selected.push(output.clone());
            total += output.value;
            break;
        } else if output.value < target + CENT {
            selected.push(output.clone());
            total += output.value;
        }
    }
    (selected, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_consensus::COIN;

    fn coin(tag: u8, value: Amount) -> SpendableOutput {
        SpendableOutput {
            txid: [tag; 32],
            vout: 0,
            value,
            depth: 10,
            from_me: true,
            tx_time: 100,
        }
    }

    #[test]
    fn exact_match_wins() {
        let coins = vec![coin(1, 5 * COIN), coin(2, 3 * COIN), coin(3, COIN)];
        let mut rng = SeededSelectorRng::new(7);
        let (selected, total) =
            select_coins_min_conf(&mut rng, 3 * COIN, 200, 1, 6, &coins).expect("select");
        assert_eq!(total, 3 * COIN);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].txid, [2u8; 32]);
    }

    #[test]
    fn single_larger_coin_preferred_over_overshoot() {
        // Scenario: [5, 3, 1] COIN, target 2.5. The only sub-target coin is
        // 1 COIN, so the smallest larger coin (3) must be chosen.
        let coins = vec![coin(1, 5 * COIN), coin(2, 3 * COIN), coin(3, COIN)];
        let mut rng = SeededSelectorRng::new(42);
        let (selected, total) =
            select_coins(&mut rng, 5 * COIN / 2, 200, &coins).expect("select");
        assert_eq!(total, 3 * COIN);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn subset_sum_gathers_small_coins() {
        // Four half-coins against a 1.2 COIN target: three make 1.5.
        let coins = vec![
            coin(1, COIN / 2),
            coin(2, COIN / 2),
            coin(3, COIN / 2),
            coin(4, COIN / 2),
        ];
        let mut rng = SeededSelectorRng::new(9);
        let (selected, total) =
            select_coins(&mut rng, 12 * COIN / 10, 200, &coins).expect("select");
        assert!(total >= 12 * COIN / 10);
        assert!(selected.len() >= 3);
        assert_eq!(total, selected.iter().map(|o| o.value).sum::<Amount>());
    }

    #[test]
    fn insufficient_funds_fails() {
        let coins = vec![coin(1, COIN)];
        let mut rng = SeededSelectorRng::new(3);
        assert!(select_coins(&mut rng, 2 * COIN, 200, &coins).is_none());
    }

    #[test]
    fn future_coins_excluded() {
        let mut future = coin(1, 5 * COIN);
        future.tx_time = 500;
        let coins = vec![future];
        let mut rng = SeededSelectorRng::new(3);
        assert!(select_coins(&mut rng, COIN, 200, &coins).is_none());
    }

    #[test]
    fn depth_tiers_cascade() {
        // A foreign coin with 3 confirmations fails the (1,6) tier but
        // passes (1,1).
        let mut foreign = coin(1, 2 * COIN);
        foreign.from_me = false;
        foreign.depth = 3;
        let coins = vec![foreign];
        let mut rng = SeededSelectorRng::new(5);
        assert!(select_coins_min_conf(&mut rng, COIN, 200, 1, 6, &coins).is_none());
        let (_, total) = select_coins(&mut rng, COIN, 200, &coins).expect("select");
        assert_eq!(total, 2 * COIN);
    }

    #[test]
    fn selection_soundness() {
        // Every successful selection covers the target with coins the
        // filter admitted.
        let coins: Vec<SpendableOutput> = (0u8..20)
            .map(|tag| coin(tag, (tag as Amount + 1) * CENT * 30))
            .collect();
        for seed in 1..40u64 {
            let mut rng = SeededSelectorRng::new(seed);
            let target = (seed as Amount) * CENT * 17;
            if let Some((selected, total)) = select_coins(&mut rng, target, 200, &coins) {
                assert!(total >= target);
                assert_eq!(total, selected.iter().map(|o| o.value).sum::<Amount>());
                let mut seen = BTreeSet::new();
                for output in &selected {
                    assert!(seen.insert(output.outpoint()), "duplicate coin selected");
                    assert!(output.tx_time <= 200);
                }
            }
        }
    }

    #[test]
    fn weak_minimality_with_singleton() {
        // With a singleton >= target available, the chosen sum stays within
        // twice the smallest such singleton.
        let coins = vec![
            coin(1, 10 * COIN),
            coin(2, 4 * COIN),
            coin(3, COIN),
            coin(4, COIN),
        ];
        for seed in 1..20u64 {
            let mut rng = SeededSelectorRng::new(seed);
            let target = 3 * COIN;
            let (_, total) = select_coins(&mut rng, target, 200, &coins).expect("select");
            assert!(total <= 2 * 4 * COIN);
        }
    }

    #[test]
    fn simple_selector_is_greedy_and_ordered() {
        let coins = vec![coin(1, COIN), coin(2, COIN), coin(3, 10 * COIN)];
        let (selected, total) = select_coins_simple(1_500_000_0, 200, &coins);
        // Walks in order, stops once the target is covered.
        assert_eq!(selected[0].txid, [1u8; 32]);
        assert!(total >= 1_500_000_0);
    }

    #[test]
    fn simple_selector_short_circuits_on_big_coin() {
        let coins = vec![coin(1, 20 * COIN)];
        let (selected, total) = select_coins_simple(COIN, 200, &coins);
        assert_eq!(selected.len(), 1);
        assert_eq!(total, 20 * COIN);
    }
}
