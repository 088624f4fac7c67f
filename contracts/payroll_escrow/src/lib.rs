#![no_std]

pub mod allowance;
pub mod funding;
pub mod vesting;

use soroban_sdk::{
    contract, contracterror, contractimpl, contracttype, symbol_short, token, Address, Env, Vec,
};

use crate::allowance::AllowanceGate;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Global configuration for the escrow.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub token: Address,
    pub admin: Address,
}

#[contracterror]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ContractError {
    NotFound = 1,
    Unauthorized = 2,
    OverFunded = 3,
    InsufficientAllowance = 4,
    InsufficientLiquidity = 5,
    NothingToWithdraw = 6,
    AlreadyCancelled = 7,
    /// The settlement layer refused or reverted the transaction.
    LedgerRejected = 8,
    /// The settlement layer could not be reached.
    LedgerUnavailable = 9,
    InvalidSchedule = 10,
    InvalidAmount = 11,
    InvalidParticipants = 12,
    AlreadyInitialised = 13,
    NotInitialised = 14,
    InvalidState = 15,
}

/// One employer-to-employee payroll commitment.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stream {
    pub id: u64,
    pub employer: Address,
    pub employee: Address,
    pub total_amount: i128,
    pub start_time: u64,
    pub end_time: u64,
    pub deposited_amount: i128,
    pub withdrawn_amount: i128,
    /// Deposited funds returned to the employer on cancellation.
    pub refunded_amount: i128,
    pub active: bool,
    pub cancelled: bool,
    pub cancelled_at: Option<u64>,
}

impl Stream {
    /// Deposited funds the employee may ever claim.
    fn claimable_cap(&self) -> i128 {
        self.deposited_amount - self.refunded_amount
    }

    /// `min(claimable cap, vested) − withdrawn` at `now`.
    fn withdrawable_at(&self, now: u64) -> Result<i128, ContractError> {
        let vested = vesting::vested_at(self, now)?;
        Ok(self.claimable_cap().min(vested) - self.withdrawn_amount)
    }
}

#[contracttype]
#[derive(Clone, Debug)]
pub struct CreateStreamParams {
    pub employee: Address,
    pub total_amount: i128,
    pub duration: u64,
}

/// Namespace for all contract storage keys.
#[contracttype]
pub enum DataKey {
    Config,                       // Instance storage for token/admin.
    NextStreamId,                 // Instance storage for the id counter.
    Stream(u64),                  // Persistent storage, one entry per stream.
    EmployeeStreamCount(Address), // Persistent storage, streams per employee.
    EmployeeStream(Address, u32), // Persistent storage, (employee, index) -> stream id.
}

const TTL_THRESHOLD: u32 = 17_280;
const TTL_EXTEND_TO: u32 = 120_960;

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

fn get_config(env: &Env) -> Result<Config, ContractError> {
    env.storage()
        .instance()
        .get(&DataKey::Config)
        .ok_or(ContractError::NotInitialised)
}

fn get_stream_count(env: &Env) -> u64 {
    env.storage()
        .instance()
        .get(&DataKey::NextStreamId)
        .unwrap_or(0u64)
}

fn set_stream_count(env: &Env, count: u64) {
    env.storage().instance().set(&DataKey::NextStreamId, &count);
    env.storage().instance().extend_ttl(TTL_THRESHOLD, TTL_EXTEND_TO);
}

fn load_stream(env: &Env, stream_id: u64) -> Result<Stream, ContractError> {
    env.storage()
        .persistent()
        .get(&DataKey::Stream(stream_id))
        .ok_or(ContractError::NotFound)
}

fn save_stream(env: &Env, stream: &Stream) {
    let key = DataKey::Stream(stream.id);
    env.storage().persistent().set(&key, stream);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

// The per-employee index is one entry per stream rather than a single growing
// vector, so it never runs into the ledger entry size limit.

fn get_employee_stream_count(env: &Env, employee: &Address) -> u32 {
    env.storage()
        .persistent()
        .get(&DataKey::EmployeeStreamCount(employee.clone()))
        .unwrap_or(0u32)
}

fn load_employee_streams(env: &Env, employee: &Address, start: u32, limit: u32) -> Vec<u64> {
    let count = get_employee_stream_count(env, employee);
    let end = start.saturating_add(limit).min(count);
    let mut ids = Vec::new(env);
    for index in start..end {
        if let Some(stream_id) = env
            .storage()
            .persistent()
            .get(&DataKey::EmployeeStream(employee.clone(), index))
        {
            ids.push_back(stream_id);
        }
    }
    ids
}

fn append_employee_stream(
    env: &Env,
    employee: &Address,
    stream_id: u64,
) -> Result<(), ContractError> {
    let index = get_employee_stream_count(env, employee);
    let next = index.checked_add(1).ok_or(ContractError::InvalidState)?;

    let entry = DataKey::EmployeeStream(employee.clone(), index);
    env.storage().persistent().set(&entry, &stream_id);
    env.storage()
        .persistent()
        .extend_ttl(&entry, TTL_THRESHOLD, TTL_EXTEND_TO);

    let count = DataKey::EmployeeStreamCount(employee.clone());
    env.storage().persistent().set(&count, &next);
    env.storage()
        .persistent()
        .extend_ttl(&count, TTL_THRESHOLD, TTL_EXTEND_TO);
    Ok(())
}

fn escrow_balance(env: &Env, config: &Config) -> i128 {
    token::Client::new(env, &config.token).balance(&env.current_contract_address())
}

/// Pays `amount` out of escrow. A refusal by the token is reported as
/// `LedgerRejected` instead of letting its own error code escape.
fn pay_out(env: &Env, config: &Config, to: &Address, amount: i128) -> Result<(), ContractError> {
    match token::Client::new(env, &config.token).try_transfer(
        &env.current_contract_address(),
        to,
        &amount,
    ) {
        Ok(Ok(())) => Ok(()),
        _ => Err(ContractError::LedgerRejected),
    }
}

// ---------------------------------------------------------------------------
// Internal Helpers
// ---------------------------------------------------------------------------

impl PayrollEscrow {
    fn validate_stream_params(
        env: &Env,
        employer: &Address,
        employee: &Address,
        total_amount: i128,
        duration: u64,
    ) -> Result<(), ContractError> {
        if employer == employee {
            return Err(ContractError::InvalidParticipants);
        }
        vesting::check_schedule(total_amount, env.ledger().timestamp(), duration)?;
        Ok(())
    }

    fn persist_new_stream(
        env: &Env,
        employer: Address,
        employee: Address,
        total_amount: i128,
        duration: u64,
    ) -> Result<u64, ContractError> {
        let start_time = env.ledger().timestamp();
        let end_time = vesting::check_schedule(total_amount, start_time, duration)?;

        let stream_id = get_stream_count(env);
        let next = stream_id.checked_add(1).ok_or(ContractError::InvalidState)?;
        set_stream_count(env, next);

        let stream = Stream {
            id: stream_id,
            employer,
            employee,
            total_amount,
            start_time,
            end_time,
            deposited_amount: 0,
            withdrawn_amount: 0,
            refunded_amount: 0,
            active: true,
            cancelled: false,
            cancelled_at: None,
        };

        save_stream(env, &stream);
        append_employee_stream(env, &stream.employee, stream_id)?;

        env.events().publish(
            (symbol_short!("created"), stream_id),
            (stream.employer, stream.employee, total_amount),
        );

        Ok(stream_id)
    }

    /// Freezes vesting at `now`, refunds the deposited remainder above the
    /// vested amount to the employer and returns the refund.
    fn settle_cancellation(env: &Env, mut stream: Stream) -> Result<i128, ContractError> {
        if stream.cancelled {
            return Err(ContractError::AlreadyCancelled);
        }

        let config = get_config(env)?;
        let now = env.ledger().timestamp();
        let vested = vesting::vested_at(&stream, now)?;
        let refund = stream.claimable_cap() - stream.claimable_cap().min(vested);

        if refund > 0 && escrow_balance(env, &config) < refund {
            return Err(ContractError::InsufficientLiquidity);
        }

        // CEI: update state before external token transfer.
        stream.cancelled = true;
        stream.active = false;
        stream.cancelled_at = Some(now);
        stream.refunded_amount += refund;
        save_stream(env, &stream);

        if refund > 0 {
            pay_out(env, &config, &stream.employer, refund)?;
        }

        env.events()
            .publish((symbol_short!("cancelled"), stream.id), refund);
        Ok(refund)
    }
}

// ---------------------------------------------------------------------------
// Contract Implementation
// ---------------------------------------------------------------------------

#[contract]
pub struct PayrollEscrow;

#[contractimpl]
impl PayrollEscrow {
    /// Initialise the escrow with the custodied token and admin address.
    ///
    /// Must be called exactly once. Stores `Config { token, admin }` in instance
    /// storage and starts the stream id counter at 0.
    ///
    /// # Errors
    /// - `AlreadyInitialised` on any call after the first
    pub fn init(env: Env, token: Address, admin: Address) -> Result<(), ContractError> {
        if env.storage().instance().has(&DataKey::Config) {
            return Err(ContractError::AlreadyInitialised);
        }
        let config = Config { token, admin };
        env.storage().instance().set(&DataKey::Config, &config);
        set_stream_count(&env, 0);
        Ok(())
    }

    /// Create a payroll stream vesting linearly from now over `duration` seconds.
    ///
    /// No funds move here; the employer funds the stream with one or more
    /// `deposit` calls afterwards. The allocated id is returned directly, so
    /// callers never need to infer it from `stream_count`.
    ///
    /// # Authorization
    /// - Requires authorization from `employer`
    ///
    /// # Errors
    /// - `InvalidParticipants` if `employer == employee`
    /// - `InvalidSchedule` if `total_amount <= 0`, `duration == 0`, or
    ///   `total_amount × duration` / `now + duration` overflow
    /// - `NotInitialised` before `init`
    ///
    /// # Events
    /// - `created(stream_id)` with `(employer, employee, total_amount)`
    pub fn create_stream(
        env: Env,
        employer: Address,
        employee: Address,
        total_amount: i128,
        duration: u64,
    ) -> Result<u64, ContractError> {
        employer.require_auth();
        get_config(&env)?;

        Self::validate_stream_params(&env, &employer, &employee, total_amount, duration)?;
        Self::persist_new_stream(&env, employer, employee, total_amount, duration)
    }

    /// Create several streams for one employer in a single transaction.
    ///
    /// Every entry is validated before any id is allocated, so the batch either
    /// creates all streams or none. Ids are returned in input order.
    pub fn create_streams(
        env: Env,
        employer: Address,
        streams: Vec<CreateStreamParams>,
    ) -> Result<Vec<u64>, ContractError> {
        employer.require_auth();
        get_config(&env)?;

        for params in streams.iter() {
            Self::validate_stream_params(
                &env,
                &employer,
                &params.employee,
                params.total_amount,
                params.duration,
            )?;
        }

        let mut created_ids = Vec::new(&env);
        for params in streams.iter() {
            let stream_id = Self::persist_new_stream(
                &env,
                employer.clone(),
                params.employee,
                params.total_amount,
                params.duration,
            )?;
            created_ids.push_back(stream_id);
        }
        Ok(created_ids)
    }

    /// Move `amount` of the token from the employer into escrow for `stream_id`.
    ///
    /// The employer must have approved the escrow for at least `amount`
    /// beforehand; the transfer spends that allowance.
    ///
    /// # Authorization
    /// - Requires authorization from `funder`, who must be the stream's employer
    ///
    /// # Errors
    /// - `NotFound`, `Unauthorized`, `AlreadyCancelled`
    /// - `OverFunded` if `amount <= 0` or `deposited_amount + amount > total_amount`
    /// - `InsufficientAllowance` if the allowance is below `amount`
    /// - `LedgerRejected` if the token refuses the transfer, e.g. the employer's
    ///   balance does not cover `amount`
    ///
    /// # Events
    /// - `deposited(stream_id)` with `amount`
    pub fn deposit(
        env: Env,
        funder: Address,
        stream_id: u64,
        amount: i128,
    ) -> Result<(), ContractError> {
        funder.require_auth();
        let config = get_config(&env)?;
        let mut stream = load_stream(&env, stream_id)?;

        if funder != stream.employer {
            return Err(ContractError::Unauthorized);
        }
        if stream.cancelled {
            return Err(ContractError::AlreadyCancelled);
        }
        if amount <= 0 {
            return Err(ContractError::OverFunded);
        }
        let deposited = stream
            .deposited_amount
            .checked_add(amount)
            .ok_or(ContractError::OverFunded)?;
        if deposited > stream.total_amount {
            return Err(ContractError::OverFunded);
        }

        let gate = AllowanceGate::new(&env, &config.token, &env.current_contract_address());
        gate.require(&funder, amount)?;

        stream.deposited_amount = deposited;
        save_stream(&env, &stream);

        gate.pull(&funder, amount)?;

        env.events()
            .publish((symbol_short!("deposited"), stream_id), amount);
        Ok(())
    }

    /// Withdraw everything newly claimable to the employee and return it.
    ///
    /// The claimable delta is `min(deposited − refunded, vested(now)) − withdrawn`.
    /// When nothing new has vested the call fails with `NothingToWithdraw`
    /// rather than recording a zero transfer, so re-issuing a withdrawal after
    /// an ambiguous outcome is harmless.
    ///
    /// # Authorization
    /// - Requires authorization from `caller`, who must be the stream's employee
    ///
    /// # Errors
    /// - `NotFound`, `Unauthorized`
    /// - `NothingToWithdraw` if the delta is not positive
    /// - `InsufficientLiquidity` if escrow custody holds less than the delta;
    ///   nothing is transferred and `withdrawn_amount` is unchanged
    ///
    /// # Events
    /// - `withdrew(stream_id)` with the amount transferred
    pub fn withdraw(env: Env, caller: Address, stream_id: u64) -> Result<i128, ContractError> {
        caller.require_auth();
        let config = get_config(&env)?;
        let mut stream = load_stream(&env, stream_id)?;

        if caller != stream.employee {
            return Err(ContractError::Unauthorized);
        }

        let delta = stream.withdrawable_at(env.ledger().timestamp())?;
        if delta <= 0 {
            return Err(ContractError::NothingToWithdraw);
        }
        if escrow_balance(&env, &config) < delta {
            return Err(ContractError::InsufficientLiquidity);
        }

        // CEI: update state before external token transfer.
        stream.withdrawn_amount += delta;
        if stream.withdrawn_amount == stream.total_amount {
            stream.active = false;
        }
        save_stream(&env, &stream);

        pay_out(&env, &config, &stream.employee, delta)?;

        env.events()
            .publish((symbol_short!("withdrew"), stream_id), delta);
        Ok(delta)
    }

    /// Cancel a stream as its employer and return the refunded amount.
    ///
    /// Vesting freezes at the current ledger timestamp. Whatever had vested and
    /// was deposited stays withdrawable by the employee; the rest of the deposit
    /// goes back to the employer. Cancellation is terminal.
    ///
    /// # Authorization
    /// - Requires authorization from `caller`, who must be the stream's employer
    ///
    /// # Errors
    /// - `NotFound`, `Unauthorized`, `AlreadyCancelled`
    /// - `InsufficientLiquidity` if escrow custody cannot cover the refund
    ///
    /// # Events
    /// - `cancelled(stream_id)` with the refund
    pub fn cancel(env: Env, caller: Address, stream_id: u64) -> Result<i128, ContractError> {
        caller.require_auth();
        let stream = load_stream(&env, stream_id)?;
        if caller != stream.employer {
            return Err(ContractError::Unauthorized);
        }
        Self::settle_cancellation(&env, stream)
    }

    /// Total vested for `stream_id` at the current ledger time.
    ///
    /// Frozen at the cancellation instant for cancelled streams.
    pub fn vested(env: Env, stream_id: u64) -> Result<i128, ContractError> {
        let stream = load_stream(&env, stream_id)?;
        vesting::vested_at(&stream, env.ledger().timestamp())
    }

    /// What `withdraw` would transfer right now, or 0.
    pub fn withdrawable(env: Env, stream_id: u64) -> Result<i128, ContractError> {
        let stream = load_stream(&env, stream_id)?;
        Ok(stream.withdrawable_at(env.ledger().timestamp())?.max(0))
    }

    pub fn get_stream(env: Env, stream_id: u64) -> Result<Stream, ContractError> {
        load_stream(&env, stream_id)
    }

    /// Ids of every stream paying `employee`, in creation order.
    ///
    /// The whole list is read in one call; employees with a long history
    /// should page through `list_streams_for_page` instead.
    pub fn list_streams_for(env: Env, employee: Address) -> Vec<u64> {
        load_employee_streams(&env, &employee, 0, u32::MAX)
    }

    /// Up to `limit` stream ids for `employee`, starting at position `start`
    /// of the creation-ordered index.
    pub fn list_streams_for_page(env: Env, employee: Address, start: u32, limit: u32) -> Vec<u64> {
        load_employee_streams(&env, &employee, start, limit)
    }

    /// Number of streams paying `employee`.
    pub fn employee_stream_count(env: Env, employee: Address) -> u32 {
        get_employee_stream_count(&env, &employee)
    }

    /// Number of streams ever created. Informational; never derive an id from it.
    pub fn stream_count(env: Env) -> u64 {
        get_stream_count(&env)
    }

    /// Allowance `owner` has granted this escrow on the custodied token.
    pub fn allowance_of(env: Env, owner: Address) -> Result<i128, ContractError> {
        let config = get_config(&env)?;
        let gate = AllowanceGate::new(&env, &config.token, &env.current_contract_address());
        Ok(gate.current_allowance(&owner))
    }

    pub fn get_config(env: Env) -> Result<Config, ContractError> {
        get_config(&env)
    }

    /// Rotate the admin key. Requires authorization from the current admin.
    ///
    /// # Events
    /// - `("admin", "updated")` with `(old_admin, new_admin)`
    pub fn set_admin(env: Env, new_admin: Address) -> Result<(), ContractError> {
        let mut config = get_config(&env)?;
        let old_admin = config.admin.clone();
        old_admin.require_auth();

        config.admin = new_admin.clone();
        env.storage().instance().set(&DataKey::Config, &config);

        env.events().publish(
            (symbol_short!("admin"), symbol_short!("updated")),
            (old_admin, new_admin),
        );
        Ok(())
    }
}

#[contractimpl]
impl PayrollEscrow {
    /// Cancel any stream as the contract admin.
    ///
    /// Same accounting as `cancel`: vesting freezes now, the vested part stays
    /// with the employee and the remaining deposit is refunded to the employer.
    ///
    /// # Authorization
    /// - Requires authorization from the admin set in `init`
    pub fn cancel_as_admin(env: Env, stream_id: u64) -> Result<i128, ContractError> {
        get_config(&env)?.admin.require_auth();
        let stream = load_stream(&env, stream_id)?;
        Self::settle_cancellation(&env, stream)
    }
}
