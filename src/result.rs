use crate::ContractError;

pub type ContractResult<T> = std::result::Result<T, ContractError>;
