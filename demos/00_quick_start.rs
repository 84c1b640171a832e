/// quick start - create a loan, pay the first installment, print the view
use loan_ledger_rs::{InMemoryStore, Ledger, LoanTerms, Money, PaymentRequest, Rate, SafeTimeProvider, TimeSource};
use chrono::{NaiveDate, TimeZone, Utc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 20, 9, 0, 0).unwrap()
    ));
    let ledger = Ledger::with_defaults(InMemoryStore::new());

    // 10,000 over 10 months at 2% per period
    let terms = LoanTerms::monthly_simple(
        Money::from_major(10_000),
        Rate::from_percentage(2),
        10,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    );
    let loan = ledger.create_loan(&terms, &time)?;
    println!("balance at origination: {}", ledger.balance(loan.id)?.total);

    // pay the first installment in full
    let receipt = ledger.apply_payment(loan.id, &PaymentRequest::new(Money::from_major(1_200)), &time)?;
    println!("installment paid: {}", receipt.installment_paid);
    println!("balance after payment: {}", receipt.new_balance);

    let view = ledger.loan_view(loan.id, time.now().date_naive())?;
    println!("{}", view.to_json_pretty()?);

    Ok(())
}
