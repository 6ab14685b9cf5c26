//! Client puzzles for connection authentication.
//!
//! Before the host commits any per-connection state, the initiator must
//! present a proof of work: a solution value whose hash together with the
//! identity token and both nonces has `difficulty` leading zero bits. The
//! host rotates its puzzle nonce periodically and remembers which initiator
//! nonces already solved the current and previous puzzle, so a solution
//! cannot be replayed to flood the host with connections.

use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use sha2::{Digest, Sha256};

use crate::connection_params::Nonce;

/// How often the host-side puzzle nonce is refreshed.
pub const PUZZLE_REFRESH_TIME: Duration = Duration::from_millis(30_000);
/// Default difficulty, tuned so initiators spend a small multiple of the
/// host's shared-secret work.
pub const INITIAL_PUZZLE_DIFFICULTY: u32 = 17;
/// Puzzles harder than this are refused by initiators.
pub const MAX_PUZZLE_DIFFICULTY: u32 = 26;
/// Solution attempts per `solve_puzzle` call; solving resumes on the next
/// tick so a hard puzzle never stalls the event loop for long.
pub const SOLUTION_FRAGMENT_ITERATIONS: u32 = 50_000;

/// Outcome of validating a submitted puzzle solution.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SolutionCheck {
    Success,
    InvalidSolution,
    InvalidHostNonce,
    /// The initiator nonce already solved this puzzle once.
    InvalidInitiatorNonce,
    InvalidDifficulty,
}

/// True if `solution` solves the puzzle for the given transcript values.
pub fn check_one_solution(
    solution: u32,
    initiator_nonce: &Nonce,
    host_nonce: &Nonce,
    puzzle_difficulty: u32,
    client_identity: u32,
) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(solution.to_le_bytes());
    hasher.update(client_identity.to_le_bytes());
    hasher.update(initiator_nonce.0);
    hasher.update(host_nonce.0);
    let hash = hasher.finalize();

    if puzzle_difficulty == 0 {
        return true;
    }
    let mut difficulty = puzzle_difficulty;
    let mut index = 0;
    while difficulty > 8 {
        if hash[index] != 0 {
            return false;
        }
        index += 1;
        difficulty -= 8;
    }
    let mask = 0xFFu8 << (8 - difficulty);
    hash[index] & mask == 0
}

/// Searches for a solution, starting at `*solution`. Returns true once a
/// solution is found; false means the iteration budget ran out and
/// `*solution` holds the trial value to resume from.
pub fn solve_puzzle(
    solution: &mut u32,
    initiator_nonce: &Nonce,
    host_nonce: &Nonce,
    puzzle_difficulty: u32,
    client_identity: u32,
) -> bool {
    let start = *solution;
    for trial in start..start.saturating_add(SOLUTION_FRAGMENT_ITERATIONS) {
        if check_one_solution(trial, initiator_nonce, host_nonce, puzzle_difficulty, client_identity) {
            *solution = trial;
            return true;
        }
    }
    *solution = start.saturating_add(SOLUTION_FRAGMENT_ITERATIONS);
    false
}

/// Issues and validates puzzles on the host side.
pub struct ClientPuzzleManager {
    current_difficulty: u32,
    current_nonce: Nonce,
    last_nonce: Nonce,
    /// Initiator nonces that already solved the current / previous puzzle.
    current_solved: FxHashSet<Nonce>,
    last_solved: FxHashSet<Nonce>,
    last_update_time: Option<Instant>,
}

impl ClientPuzzleManager {
    pub fn new(difficulty: u32, current_nonce: Nonce, last_nonce: Nonce) -> ClientPuzzleManager {
        ClientPuzzleManager {
            current_difficulty: difficulty,
            current_nonce,
            last_nonce,
            current_solved: FxHashSet::default(),
            last_solved: FxHashSet::default(),
            last_update_time: None,
        }
    }

    pub fn current_nonce(&self) -> Nonce {
        self.current_nonce
    }

    pub fn current_difficulty(&self) -> u32 {
        self.current_difficulty
    }

    /// Rotates the puzzle nonce when the refresh interval has passed. The
    /// previous nonce stays valid so in-flight solutions still land.
    pub fn tick(&mut self, current_time: Instant, fresh_nonce: Nonce) {
        let last_update = *self.last_update_time.get_or_insert(current_time);
        if current_time.duration_since(last_update) > PUZZLE_REFRESH_TIME {
            self.last_update_time = Some(current_time);
            self.last_nonce = self.current_nonce;
            self.last_solved = std::mem::take(&mut self.current_solved);
            self.current_nonce = fresh_nonce;
        }
    }

    /// Validates a solution submitted in a connect request.
    pub fn check_solution(
        &mut self,
        solution: u32,
        initiator_nonce: Nonce,
        host_nonce: Nonce,
        puzzle_difficulty: u32,
        client_identity: u32,
    ) -> SolutionCheck {
        if puzzle_difficulty != self.current_difficulty {
            return SolutionCheck::InvalidDifficulty;
        }
        let solved = if host_nonce == self.current_nonce {
            &mut self.current_solved
        } else if host_nonce == self.last_nonce {
            &mut self.last_solved
        } else {
            return SolutionCheck::InvalidHostNonce;
        };

        if !check_one_solution(solution, &initiator_nonce, &host_nonce, puzzle_difficulty, client_identity) {
            return SolutionCheck::InvalidSolution;
        }
        if !solved.insert(initiator_nonce) {
            return SolutionCheck::InvalidInitiatorNonce;
        }
        SolutionCheck::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    const DIFFICULTY: u32 = 4;

    fn nonce(fill: u8) -> Nonce {
        Nonce([fill; Nonce::SIZE])
    }

    fn solve(initiator: &Nonce, host: &Nonce, identity: u32) -> u32 {
        let mut solution = 0;
        while !solve_puzzle(&mut solution, initiator, host, DIFFICULTY, identity) {}
        solution
    }

    #[test]
    fn test_solve_and_check_roundtrip() {
        let solution = solve(&nonce(1), &nonce(2), 42);
        assert!(check_one_solution(solution, &nonce(1), &nonce(2), DIFFICULTY, 42));
        assert!(!check_one_solution(solution, &nonce(1), &nonce(2), DIFFICULTY, 43));
    }

    #[test]
    fn test_manager_accepts_then_rejects_replay() {
        let mut manager = ClientPuzzleManager::new(DIFFICULTY, nonce(2), nonce(3));
        let solution = solve(&nonce(1), &nonce(2), 42);

        assert_eq!(
            manager.check_solution(solution, nonce(1), nonce(2), DIFFICULTY, 42),
            SolutionCheck::Success
        );
        assert_eq!(
            manager.check_solution(solution, nonce(1), nonce(2), DIFFICULTY, 42),
            SolutionCheck::InvalidInitiatorNonce
        );
    }

    #[test]
    fn test_manager_accepts_previous_nonce() {
        let mut manager = ClientPuzzleManager::new(DIFFICULTY, nonce(2), nonce(3));
        let solution = solve(&nonce(1), &nonce(3), 42);

        assert_eq!(
            manager.check_solution(solution, nonce(1), nonce(3), DIFFICULTY, 42),
            SolutionCheck::Success
        );
    }

    #[rstest]
    #[case::unknown_nonce(nonce(9), DIFFICULTY, SolutionCheck::InvalidHostNonce)]
    #[case::wrong_difficulty(nonce(2), DIFFICULTY + 1, SolutionCheck::InvalidDifficulty)]
    fn test_manager_rejects(#[case] host_nonce: Nonce, #[case] difficulty: u32, #[case] expected: SolutionCheck) {
        let mut manager = ClientPuzzleManager::new(DIFFICULTY, nonce(2), nonce(3));
        assert_eq!(
            manager.check_solution(0, nonce(1), host_nonce, difficulty, 42),
            expected
        );
    }

    #[test]
    fn test_wrong_solution_rejected() {
        let mut manager = ClientPuzzleManager::new(DIFFICULTY, nonce(2), nonce(3));

        let mut bad = 0;
        while check_one_solution(bad, &nonce(1), &nonce(2), DIFFICULTY, 42) {
            bad += 1;
        }
        assert_eq!(
            manager.check_solution(bad, nonce(1), nonce(2), DIFFICULTY, 42),
            SolutionCheck::InvalidSolution
        );
    }

    #[test]
    fn test_tick_rotates_nonce() {
        let mut manager = ClientPuzzleManager::new(DIFFICULTY, nonce(2), nonce(3));
        let t0 = Instant::now();
        manager.tick(t0, nonce(4));
        assert_eq!(manager.current_nonce(), nonce(2));

        manager.tick(t0 + PUZZLE_REFRESH_TIME + Duration::from_millis(1), nonce(4));
        assert_eq!(manager.current_nonce(), nonce(4));

        // the previous nonce still validates
        let solution = solve(&nonce(1), &nonce(2), 42);
        assert_eq!(
            manager.check_solution(solution, nonce(1), nonce(2), DIFFICULTY, 42),
            SolutionCheck::Success
        );
    }
}
