//! Client-side funding workflow: create a stream, approve the escrow if the
//! current allowance is short, then deposit.
//!
//! The workflow is a saga over separate ledger transactions. Each step waits
//! for the previous one to return before it runs, the allowance is re-read
//! right before the deposit, and nothing is ever retried or compensated
//! automatically. A failed step parks the flow in [`FundingState::Failed`]
//! until the operator calls [`FundingFlow::retry`] and advances again.

use soroban_sdk::{log, Address, Env};

use crate::{allowance::AllowanceGate, ContractError, PayrollEscrowClient};

/// Ledger operations the workflow submits. Each call returns once the
/// transaction is confirmed or refused.
pub trait FundingLedger {
    fn create_stream(
        &self,
        employer: &Address,
        employee: &Address,
        total_amount: i128,
        duration: u64,
    ) -> Result<u64, ContractError>;

    fn current_allowance(&self, owner: &Address) -> Result<i128, ContractError>;

    fn approve(&self, owner: &Address, amount: i128) -> Result<(), ContractError>;

    fn deposit(&self, funder: &Address, stream_id: u64, amount: i128)
        -> Result<(), ContractError>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FundingRequest {
    pub employer: Address,
    pub employee: Address,
    pub total_amount: i128,
    pub duration: u64,
    /// Amount to deposit once the stream exists.
    pub deposit_amount: i128,
}

impl FundingRequest {
    /// Checks that can be made without a ledger round trip.
    fn validate(&self) -> Result<(), ContractError> {
        if self.employer == self.employee {
            return Err(ContractError::InvalidParticipants);
        }
        if self.total_amount <= 0 || self.duration == 0 {
            return Err(ContractError::InvalidSchedule);
        }
        if self.deposit_amount <= 0 || self.deposit_amount > self.total_amount {
            return Err(ContractError::OverFunded);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FundingStep {
    Create,
    Confirm,
    Approve,
    Deposit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FundingState {
    Idle,
    Creating,
    /// Stream exists; waiting for the operator to confirm the deposit.
    AwaitingConfirmation { stream_id: u64 },
    AwaitingApproval { stream_id: u64 },
    Depositing { stream_id: u64 },
    Complete { stream_id: u64 },
    Failed {
        step: FundingStep,
        stream_id: Option<u64>,
        error: ContractError,
    },
}

#[derive(Clone, Debug)]
pub struct FundingFlow {
    request: FundingRequest,
    state: FundingState,
}

impl FundingFlow {
    pub fn new(request: FundingRequest) -> Self {
        FundingFlow {
            request,
            state: FundingState::Idle,
        }
    }

    /// Resume a flow from a previously recorded state.
    pub fn resume(request: FundingRequest, state: FundingState) -> Self {
        FundingFlow { request, state }
    }

    pub fn request(&self) -> &FundingRequest {
        &self.request
    }

    pub fn state(&self) -> &FundingState {
        &self.state
    }

    pub fn stream_id(&self) -> Option<u64> {
        match self.state {
            FundingState::Idle | FundingState::Creating => None,
            FundingState::AwaitingConfirmation { stream_id }
            | FundingState::AwaitingApproval { stream_id }
            | FundingState::Depositing { stream_id }
            | FundingState::Complete { stream_id } => Some(stream_id),
            FundingState::Failed { stream_id, .. } => stream_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            FundingState::Complete { .. } | FundingState::Failed { .. }
        )
    }

    /// Perform exactly one transition.
    ///
    /// The confirmation prompt and the terminal states are left unchanged:
    /// leaving them takes an explicit [`confirm`](Self::confirm) or
    /// [`retry`](Self::retry).
    pub fn advance<L: FundingLedger>(self, ledger: &L) -> Self {
        let FundingFlow { request, state } = self;
        let state = match state {
            FundingState::Idle => match request.validate() {
                Ok(()) => FundingState::Creating,
                Err(error) => FundingState::Failed {
                    step: FundingStep::Create,
                    stream_id: None,
                    error,
                },
            },
            FundingState::Creating => match ledger.create_stream(
                &request.employer,
                &request.employee,
                request.total_amount,
                request.duration,
            ) {
                Ok(stream_id) => FundingState::AwaitingConfirmation { stream_id },
                Err(error) => FundingState::Failed {
                    step: FundingStep::Create,
                    stream_id: None,
                    error,
                },
            },
            FundingState::AwaitingApproval { stream_id } => {
                approve_and_recheck(&request, ledger, stream_id)
            }
            FundingState::Depositing { stream_id } => {
                recheck_and_deposit(&request, ledger, stream_id)
            }
            waiting => waiting,
        };
        FundingFlow { request, state }
    }

    /// Operator confirmation of the deposit prompt.
    ///
    /// Reads the allowance and only routes through approval when it is below
    /// the deposit amount. Outside the prompt state this is a no-op.
    pub fn confirm<L: FundingLedger>(self, ledger: &L) -> Self {
        let FundingFlow { request, state } = self;
        let state = match state {
            FundingState::AwaitingConfirmation { stream_id } => {
                match ledger.current_allowance(&request.employer) {
                    Ok(allowance) if allowance < request.deposit_amount => {
                        FundingState::AwaitingApproval { stream_id }
                    }
                    Ok(_) => FundingState::Depositing { stream_id },
                    Err(error) => FundingState::Failed {
                        step: FundingStep::Confirm,
                        stream_id: Some(stream_id),
                        error,
                    },
                }
            }
            other => other,
        };
        FundingFlow { request, state }
    }

    /// Re-arm the step that failed. No ledger call is made here.
    ///
    /// A deposit that failed for lack of allowance goes back through approval.
    /// Outside `Failed` this is a no-op.
    pub fn retry(self) -> Self {
        let FundingFlow { request, state } = self;
        let state = match state {
            FundingState::Failed {
                step,
                stream_id,
                error,
            } => match (step, stream_id) {
                (FundingStep::Create, _) | (_, None) => FundingState::Idle,
                (FundingStep::Confirm, Some(stream_id)) => {
                    FundingState::AwaitingConfirmation { stream_id }
                }
                (FundingStep::Approve, Some(stream_id)) => {
                    FundingState::AwaitingApproval { stream_id }
                }
                (FundingStep::Deposit, Some(stream_id))
                    if error == ContractError::InsufficientAllowance =>
                {
                    FundingState::AwaitingApproval { stream_id }
                }
                (FundingStep::Deposit, Some(stream_id)) => {
                    FundingState::Depositing { stream_id }
                }
            },
            other => other,
        };
        FundingFlow { request, state }
    }

    /// Advance through validation and creation up to the confirmation prompt,
    /// or until a step fails.
    pub fn run_until_prompt<L: FundingLedger>(mut self, ledger: &L) -> Self {
        while matches!(self.state, FundingState::Idle | FundingState::Creating) {
            self = self.advance(ledger);
        }
        self
    }

    /// Advance through approval and deposit after confirmation, until the flow
    /// completes or a step fails.
    pub fn run_to_end<L: FundingLedger>(mut self, ledger: &L) -> Self {
        while matches!(
            self.state,
            FundingState::AwaitingApproval { .. } | FundingState::Depositing { .. }
        ) {
            self = self.advance(ledger);
        }
        self
    }
}

fn approve_and_recheck<L: FundingLedger>(
    request: &FundingRequest,
    ledger: &L,
    stream_id: u64,
) -> FundingState {
    let failed = |error| FundingState::Failed {
        step: FundingStep::Approve,
        stream_id: Some(stream_id),
        error,
    };

    if let Err(error) = ledger.approve(&request.employer, request.deposit_amount) {
        return failed(error);
    }
    // The approval is confirmed, but the allowance it set may already have
    // been spent or replaced.
    match ledger.current_allowance(&request.employer) {
        Ok(allowance) if allowance >= request.deposit_amount => {
            FundingState::Depositing { stream_id }
        }
        Ok(_) => failed(ContractError::InsufficientAllowance),
        Err(error) => failed(error),
    }
}

fn recheck_and_deposit<L: FundingLedger>(
    request: &FundingRequest,
    ledger: &L,
    stream_id: u64,
) -> FundingState {
    let failed = |error| FundingState::Failed {
        step: FundingStep::Deposit,
        stream_id: Some(stream_id),
        error,
    };

    match ledger.current_allowance(&request.employer) {
        Ok(allowance) if allowance < request.deposit_amount => {
            failed(ContractError::InsufficientAllowance)
        }
        Ok(_) => match ledger.deposit(&request.employer, stream_id, request.deposit_amount) {
            Ok(()) => FundingState::Complete { stream_id },
            Err(error) => failed(error),
        },
        Err(error) => failed(error),
    }
}

/// [`FundingLedger`] backed by the generated escrow client and the token client.
///
/// Contract errors pass through unchanged; any other refusal from the host
/// (auth failure, token trap, conversion error) becomes `LedgerRejected`.
pub struct ClientLedger<'a> {
    escrow: PayrollEscrowClient<'a>,
    gate: AllowanceGate<'a>,
}

impl<'a> ClientLedger<'a> {
    pub fn new(env: &Env, escrow: &Address, token: &Address) -> Self {
        ClientLedger {
            escrow: PayrollEscrowClient::new(env, escrow),
            gate: AllowanceGate::new(env, token, escrow),
        }
    }

    fn env(&self) -> &Env {
        &self.escrow.env
    }
}

fn settle<T, C, I>(
    result: Result<Result<T, C>, Result<ContractError, I>>,
) -> Result<T, ContractError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Err(Ok(error)) => Err(error),
        _ => Err(ContractError::LedgerRejected),
    }
}

impl<'a> FundingLedger for ClientLedger<'a> {
    fn create_stream(
        &self,
        employer: &Address,
        employee: &Address,
        total_amount: i128,
        duration: u64,
    ) -> Result<u64, ContractError> {
        let result = settle(self.escrow.try_create_stream(
            employer,
            employee,
            &total_amount,
            &duration,
        ));
        log!(self.env(), "funding: create_stream", total_amount, duration, result.is_ok());
        result
    }

    fn current_allowance(&self, owner: &Address) -> Result<i128, ContractError> {
        self.gate.try_current_allowance(owner)
    }

    fn approve(&self, owner: &Address, amount: i128) -> Result<(), ContractError> {
        let result = self.gate.approve(owner, amount);
        log!(self.env(), "funding: approve", amount, result.is_ok());
        result
    }

    fn deposit(
        &self,
        funder: &Address,
        stream_id: u64,
        amount: i128,
    ) -> Result<(), ContractError> {
        let result = settle(self.escrow.try_deposit(funder, &stream_id, &amount));
        log!(self.env(), "funding: deposit", stream_id, amount, result.is_ok());
        result
    }
}
