use soroban_sdk::{token, Address, Env};

use crate::ContractError;

/// Ledgers an approval stays live for; matches the stream TTL extension.
pub const APPROVAL_LIVE_LEDGERS: u32 = 120_960;

/// "Approve, then move funds" against the custodied token.
///
/// The spender is always the escrow contract. The same gate serves the contract
/// (checking and spending an allowance during `deposit`) and clients (reading
/// and granting the allowance before a deposit).
pub struct AllowanceGate<'a> {
    env: Env,
    token: token::Client<'a>,
    escrow: Address,
}

impl<'a> AllowanceGate<'a> {
    pub fn new(env: &Env, token: &Address, escrow: &Address) -> Self {
        AllowanceGate {
            env: env.clone(),
            token: token::Client::new(env, token),
            escrow: escrow.clone(),
        }
    }

    /// Point-in-time allowance `owner` has granted the escrow.
    pub fn current_allowance(&self, owner: &Address) -> i128 {
        self.token.allowance(owner, &self.escrow)
    }

    /// Like [`current_allowance`](Self::current_allowance), but a failed read is
    /// reported instead of aborting the caller.
    pub fn try_current_allowance(&self, owner: &Address) -> Result<i128, ContractError> {
        match self.token.try_allowance(owner, &self.escrow) {
            Ok(Ok(amount)) => Ok(amount),
            _ => Err(ContractError::LedgerRejected),
        }
    }

    /// Sets the allowance to exactly `amount`, replacing any prior value.
    ///
    /// To raise an existing allowance the caller reads it first and approves
    /// the sum.
    pub fn approve(&self, owner: &Address, amount: i128) -> Result<(), ContractError> {
        if amount < 0 {
            return Err(ContractError::InvalidAmount);
        }
        let live_until = self
            .env
            .ledger()
            .sequence()
            .saturating_add(APPROVAL_LIVE_LEDGERS);
        match self
            .token
            .try_approve(owner, &self.escrow, &amount, &live_until)
        {
            Ok(Ok(())) => Ok(()),
            _ => Err(ContractError::LedgerRejected),
        }
    }

    pub fn require(&self, owner: &Address, amount: i128) -> Result<(), ContractError> {
        if self.current_allowance(owner) < amount {
            return Err(ContractError::InsufficientAllowance);
        }
        Ok(())
    }

    /// Moves `amount` from `owner` into escrow, spending the allowance.
    ///
    /// Only callable from inside the escrow contract, which is the spender. A
    /// token refusal (short balance, expired approval) is `LedgerRejected`.
    pub fn pull(&self, owner: &Address, amount: i128) -> Result<(), ContractError> {
        match self
            .token
            .try_transfer_from(&self.escrow, owner, &self.escrow, &amount)
        {
            Ok(Ok(())) => Ok(()),
            _ => Err(ContractError::LedgerRejected),
        }
    }
}
