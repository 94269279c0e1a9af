use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /* reconcile keys are namespace/name */
    #[error("invalid resource key: `{0}`")]
    InvalidKey(String),

    /* the owner changed under us while adopting or releasing */
    #[error("adoption error: {0}")]
    Adoption(String),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {

    pub fn is_not_found(&self) -> bool {
	match self {
	    Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
	    _ => false,
	}
    }

    pub fn is_already_exists(&self) -> bool {
	match self {
	    Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "AlreadyExists",
	    _ => false,
	}
    }
}

/*
 * MultiError collects every failure of a fan-out of independent child
 * operations. A single failure is enough to retry the owning grid.
 */
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {

    pub fn new() -> Self {
	Self::default()
    }

    pub fn push(&mut self, err: Error) {
	self.errors.push(err);
    }

    pub fn len(&self) -> usize {
	self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
	self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
	&self.errors
    }

    /*
     * Ok(()) when nothing failed, otherwise the aggregate.
     */
    pub fn into_result(self) -> Result<()> {
	if self.errors.is_empty() {
	    Ok(())
	} else {
	    Err(Error::Multi(self))
	}
    }
}

impl FromIterator<Error> for MultiError {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
	Self{
	    errors: iter.into_iter().collect(),
	}
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	if self.errors.len() == 1 {
	    return write!(f, "{}", self.errors[0]);
	}

	write!(f, "[")?;
	for (i, err) in self.errors.iter().enumerate() {
	    if i > 0 {
		write!(f, ", ")?;
	    }
	    write!(f, "{}", err)?;
	}
	write!(f, "]")
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse{
	status: String::from("Failure"),
	message: format!("{} (test)", reason),
	reason: reason.to_string(),
	code: code,
    }))
}
