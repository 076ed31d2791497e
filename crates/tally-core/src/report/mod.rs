pub mod xunit;
