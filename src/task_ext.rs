use crate::{
    Cancellation,
    completion::{self, Completion, InCompletionOrder},
};

/// Extend collections of futures with completion ordering operators.
pub trait CompletionExt: IntoIterator
where
    Self::Item: Future,
{
    /// See [`order_by_completion`](crate::order_by_completion).
    fn order_by_completion(self) -> Vec<Completion<Self::Item>>
    where
        Self: Sized,
    {
        completion::order_by_completion(self)
    }

    /// See [`in_completion_order`](crate::in_completion_order).
    fn in_completion_order(self, cancellation: Cancellation) -> InCompletionOrder<Self::Item>
    where
        Self: Sized,
    {
        completion::in_completion_order(self, cancellation)
    }
}

impl<I> CompletionExt for I
where
    I: IntoIterator,
    I::Item: Future,
{
}
